// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP server callback functions.
//!
//! Functions in this module parse VM identifiers out of request paths, hand
//! the request to the [`Registry`], and convert registry errors into HTTP
//! error codes. Successful VM responses carry CORS headers (see
//! [`crate::cors`]), and each VM path answers preflight `OPTIONS` requests.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use dropshot::{
    endpoint, ApiDescription, Body, HttpError, HttpResponseDeleted,
    HttpResponseHeaders, HttpResponseOk, HttpResponseUpdatedNoContent, Path,
    RequestContext,
};
use http::{header, Response, StatusCode};
use schemars::JsonSchema;
use serde::Deserialize;
use slog::{info, o, Logger};
use vmfleet::{Registry, RegistryError, Vm, VmId};

use crate::{cors, ui};

/// Contextual information accessible from HTTP callbacks.
pub struct Context {
    registry: Registry,
    ui_folder: Option<PathBuf>,
    log: Logger,
}

impl Context {
    pub fn new(
        registry: Registry,
        ui_folder: Option<PathBuf>,
        log: Logger,
    ) -> Self {
        Context { registry, ui_folder, log }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[derive(Deserialize, JsonSchema)]
pub struct VmPathParams {
    pub vm_id: u32,
}

impl VmPathParams {
    fn id(self) -> VmId {
        self.vm_id.into()
    }
}

#[derive(Deserialize, JsonSchema)]
struct UiPathParams {
    path: Vec<String>,
}

fn vm_not_found(id: VmId) -> HttpError {
    let msg = RegistryError::NotFound(id).to_string();
    HttpError::for_not_found(Some("VmNotFound".to_string()), msg)
}

fn registry_error(err: RegistryError) -> HttpError {
    match err {
        RegistryError::NotFound(id) => vm_not_found(id),
        RegistryError::IllegalTransition(_) => HttpError::for_bad_request(
            Some("IllegalTransition".to_string()),
            err.to_string(),
        ),
        RegistryError::DriverUnavailable => HttpError::for_unavail(
            Some("DriverUnavailable".to_string()),
            err.to_string(),
        ),
    }
}

/// List all VMs, keyed by ID.
#[endpoint {
    method = GET,
    path = "/vms",
}]
async fn vms_list(
    rqctx: RequestContext<Arc<Context>>,
) -> Result<HttpResponseHeaders<HttpResponseOk<BTreeMap<VmId, Vm>>>, HttpError>
{
    let vms = rqctx.context().registry().list();
    Ok(cors::allow_origin(rqctx.request.headers(), HttpResponseOk(vms)))
}

/// Inspect a VM by ID.
#[endpoint {
    method = GET,
    path = "/vms/{vm_id}",
}]
async fn vm_get(
    rqctx: RequestContext<Arc<Context>>,
    path_params: Path<VmPathParams>,
) -> Result<HttpResponseHeaders<HttpResponseOk<Vm>>, HttpError> {
    let id = path_params.into_inner().id();
    let vm = rqctx
        .context()
        .registry()
        .inspect(id)
        .ok_or_else(|| vm_not_found(id))?;
    Ok(cors::allow_origin(rqctx.request.headers(), HttpResponseOk(vm)))
}

/// Launch a stopped VM. The VM is `Starting` when this returns and becomes
/// `Running` once its simulated boot completes.
#[endpoint {
    method = PUT,
    path = "/vms/{vm_id}/launch",
}]
async fn vm_launch(
    rqctx: RequestContext<Arc<Context>>,
    path_params: Path<VmPathParams>,
) -> Result<HttpResponseHeaders<HttpResponseUpdatedNoContent>, HttpError> {
    let id = path_params.into_inner().id();
    rqctx.context().registry().launch(id).map_err(registry_error)?;
    Ok(cors::allow_origin(
        rqctx.request.headers(),
        HttpResponseUpdatedNoContent {},
    ))
}

/// Stop a running VM. The VM is `Stopping` when this returns and becomes
/// `Stopped` once its simulated shutdown completes.
#[endpoint {
    method = PUT,
    path = "/vms/{vm_id}/stop",
}]
async fn vm_stop(
    rqctx: RequestContext<Arc<Context>>,
    path_params: Path<VmPathParams>,
) -> Result<HttpResponseHeaders<HttpResponseUpdatedNoContent>, HttpError> {
    let id = path_params.into_inner().id();
    rqctx.context().registry().stop(id).map_err(registry_error)?;
    Ok(cors::allow_origin(
        rqctx.request.headers(),
        HttpResponseUpdatedNoContent {},
    ))
}

/// Delete a VM by ID.
#[endpoint {
    method = DELETE,
    path = "/vms/{vm_id}",
}]
async fn vm_delete(
    rqctx: RequestContext<Arc<Context>>,
    path_params: Path<VmPathParams>,
) -> Result<HttpResponseHeaders<HttpResponseDeleted>, HttpError> {
    let id = path_params.into_inner().id();
    if !rqctx.context().registry().delete(id) {
        return Err(vm_not_found(id));
    }
    Ok(cors::allow_origin(rqctx.request.headers(), HttpResponseDeleted {}))
}

#[endpoint {
    method = OPTIONS,
    path = "/vms",
    unpublished = true,
}]
async fn vms_preflight(
    rqctx: RequestContext<Arc<Context>>,
) -> Result<Response<Body>, HttpError> {
    cors::preflight(rqctx.request.headers(), "GET")
}

#[endpoint {
    method = OPTIONS,
    path = "/vms/{vm_id}",
    unpublished = true,
}]
async fn vm_preflight(
    rqctx: RequestContext<Arc<Context>>,
    _path_params: Path<VmPathParams>,
) -> Result<Response<Body>, HttpError> {
    cors::preflight(rqctx.request.headers(), "GET, DELETE")
}

#[endpoint {
    method = OPTIONS,
    path = "/vms/{vm_id}/launch",
    unpublished = true,
}]
async fn vm_launch_preflight(
    rqctx: RequestContext<Arc<Context>>,
    _path_params: Path<VmPathParams>,
) -> Result<Response<Body>, HttpError> {
    cors::preflight(rqctx.request.headers(), "PUT")
}

#[endpoint {
    method = OPTIONS,
    path = "/vms/{vm_id}/stop",
    unpublished = true,
}]
async fn vm_stop_preflight(
    rqctx: RequestContext<Arc<Context>>,
    _path_params: Path<VmPathParams>,
) -> Result<Response<Body>, HttpError> {
    cors::preflight(rqctx.request.headers(), "PUT")
}

#[endpoint {
    method = GET,
    path = "/ui/{path:.*}",
    unpublished = true,
}]
async fn ui_file(
    rqctx: RequestContext<Arc<Context>>,
    path_params: Path<UiPathParams>,
) -> Result<Response<Body>, HttpError> {
    let Some(root) = rqctx.context().ui_folder.as_deref() else {
        return Err(HttpError::for_not_found(
            None,
            "no UI folder is configured".to_string(),
        ));
    };

    let path = ui::resolve(root, &path_params.into_inner().path)?;
    let contents = ui::read(&path).await?;
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, ui::content_type(&path))
        .body(contents.into())?)
}

/// Returns a Dropshot [`ApiDescription`] for the vmfleet API.
pub fn api() -> ApiDescription<Arc<Context>> {
    let mut api = ApiDescription::new();
    api.register(vms_list).unwrap();
    api.register(vm_get).unwrap();
    api.register(vm_launch).unwrap();
    api.register(vm_stop).unwrap();
    api.register(vm_delete).unwrap();
    api.register(vms_preflight).unwrap();
    api.register(vm_preflight).unwrap();
    api.register(vm_launch_preflight).unwrap();
    api.register(vm_stop_preflight).unwrap();
    api.register(ui_file).unwrap();
    api
}

/// configuration for the dropshot server
pub type Config = dropshot::ConfigDropshot;
/// the dropshot server itself
pub type Server = dropshot::HttpServer<Arc<Context>>;
/// errors returned from attempting to start a dropshot server
pub type ServerStartError = Box<dyn std::error::Error + Send + Sync>;

/// Starts serving the vmfleet API for `context`.
pub fn start(
    config: &Config,
    context: Context,
    log: &Logger,
) -> Result<Server, ServerStartError> {
    let dropshot_log = log.new(o!("component" => "dropshot"));
    info!(context.log, "Starting server";
          "address" => %config.bind_address,
          "vms" => context.registry().list().len(),
          "ui" => context.ui_folder.is_some());

    let starter = dropshot::HttpServerStarter::new(
        config,
        api(),
        Arc::new(context),
        &dropshot_log,
    )?;
    Ok(starter.start())
}
