use crate::nat::{
    DirectorEndpoint, NatDispatcher, NatError, NatRuleSummary, PortForwardingConfig,
};
use crate::net::{HostAndPort, ParseError};
#[cfg(feature = "dashmap")]
use crate::throttle::ThrottleRegistry;
use actix_web::http::StatusCode;
use actix_web::{delete, get, put, web, HttpResponse, ResponseError};
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NatServiceError {
    #[error("Invalid request: {0}")]
    InvalidArgument(
        #[source]
        #[from]
        ParseError,
    ),
    #[error(transparent)]
    Nat(#[from] NatError),
}

impl ResponseError for NatServiceError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Self::Nat(NatError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Nat(NatError::Director(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        match self.status_code() {
            // Director failures may echo endpoint details, keep them in the log only
            StatusCode::INTERNAL_SERVER_ERROR => HttpResponse::InternalServerError().finish(),
            status => HttpResponse::build(status).body(self.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PortForwardingQuery {
    endpoint: String,
    identity: String,
    credential: String,
    protocol: String,
    original: String,
    translated: String,
}

impl PortForwardingQuery {
    fn endpoint(&self) -> DirectorEndpoint {
        DirectorEndpoint {
            endpoint: self.endpoint.clone(),
            identity: self.identity.clone(),
            credential: self.credential.clone(),
        }
    }

    fn config(&self) -> Result<PortForwardingConfig, ParseError> {
        let original: HostAndPort = self.original.parse()?;
        let target: HostAndPort = self.translated.parse()?;
        target.require_port()?;
        Ok(PortForwardingConfig {
            protocol: self.protocol.parse()?,
            public_ip: original.host().to_owned(),
            public_port: original.require_port()?,
            target,
        })
    }
}

/// Lists, opens and closes NAT rules through a [NatDispatcher].
///
/// Register it on an [App](actix_web::App) with [NatService::configure]:
///
/// ```no_run
/// # use actix_web::App;
/// # use std::sync::Arc;
/// # use subnet_portforwarding::nat::{NatDispatcher, NatService};
/// # fn example(dispatcher: Arc<dyn NatDispatcher>) {
/// let service = NatService::new(dispatcher);
/// let app = App::new().configure(|cfg| service.configure(cfg));
/// # }
/// ```
#[derive(Clone)]
pub struct NatService {
    dispatcher: Arc<dyn NatDispatcher>,
    #[cfg(feature = "dashmap")]
    pacing: Option<ThrottleRegistry>,
}

impl NatService {
    pub fn new(dispatcher: Arc<dyn NatDispatcher>) -> Self {
        Self {
            dispatcher,
            #[cfg(feature = "dashmap")]
            pacing: None,
        }
    }

    /// Space out rule changes made against the same cloud director endpoint.
    #[cfg(feature = "dashmap")]
    #[cfg_attr(docsrs, doc(cfg(feature = "dashmap")))]
    pub fn with_endpoint_pacing(mut self, registry: ThrottleRegistry) -> Self {
        self.pacing = Some(registry);
        self
    }

    pub fn configure(self, cfg: &mut web::ServiceConfig) {
        cfg.app_data(web::Data::new(self))
            .service(list)
            .service(open_port_forwarding)
            .service(close_port_forwarding);
    }

    #[cfg(feature = "dashmap")]
    async fn paced<F: Future>(&self, endpoint: &str, work: F) -> F::Output {
        match &self.pacing {
            Some(registry) => registry.throttle(endpoint).run(work).await,
            None => work.await,
        }
    }

    #[cfg(not(feature = "dashmap"))]
    async fn paced<F: Future>(&self, _endpoint: &str, work: F) -> F::Output {
        work.await
    }
}

#[get("/v1/nat")]
async fn list(
    service: web::Data<NatService>,
    query: web::Query<DirectorEndpoint>,
) -> Result<web::Json<Vec<NatRuleSummary>>, NatServiceError> {
    let endpoint = query.into_inner();
    let rules = service
        .dispatcher
        .nat_rules(&endpoint)
        .await
        .map_err(|e| {
            log::error!("Listing NAT rules on {} failed: {e}", endpoint.endpoint);
            e
        })?;
    Ok(web::Json(rules.iter().map(NatRuleSummary::from).collect()))
}

#[put("/v1/nat")]
async fn open_port_forwarding(
    service: web::Data<NatService>,
    query: web::Query<PortForwardingQuery>,
) -> Result<HttpResponse, NatServiceError> {
    let config = query.config()?;
    let endpoint = query.endpoint();
    log::info!("Opening port forwarding on {}: {config}", endpoint.endpoint);
    service
        .paced(
            &endpoint.endpoint,
            service.dispatcher.open_port_forwarding(&endpoint, config),
        )
        .await
        .map_err(|e| {
            log::error!("Opening port forwarding on {} failed: {e}", endpoint.endpoint);
            e
        })?;
    Ok(HttpResponse::Ok().finish())
}

#[delete("/v1/nat")]
async fn close_port_forwarding(
    service: web::Data<NatService>,
    query: web::Query<PortForwardingQuery>,
) -> Result<HttpResponse, NatServiceError> {
    let config = query.config()?;
    let endpoint = query.endpoint();
    log::info!("Closing port forwarding on {}: {config}", endpoint.endpoint);
    service
        .paced(
            &endpoint.endpoint,
            service.dispatcher.close_port_forwarding(&endpoint, config),
        )
        .await
        .map_err(|e| {
            match &e {
                NatError::NotFound(_) => log::warn!("{e}"),
                NatError::Director(_) => {
                    log::error!("Closing port forwarding on {} failed: {e}", endpoint.endpoint)
                }
            }
            e
        })?;
    Ok(HttpResponse::Ok().finish())
}
