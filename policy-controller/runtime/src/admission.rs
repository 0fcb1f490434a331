use crate::{
    k8s::Pod,
    reconcile::{AdmissionEvent, Decision, KubeStore, Operation, PodSnapshot, Reconciler},
};
use anyhow::{anyhow, Result};
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use kube::core::{admission, DynamicObject};
use thiserror::Error;
use tracing::{debug, info, info_span, trace, warn, Instrument};

/// Serves pod admission reviews, reconciling each pod's egress policies
/// before answering.
#[derive(Clone)]
pub struct Admission {
    reconciler: Reconciler<KubeStore>,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

type Review = admission::AdmissionReview<Pod>;
type AdmissionRequest = admission::AdmissionRequest<Pod>;
type AdmissionResponse = admission::AdmissionResponse;
type AdmissionReview = admission::AdmissionReview<DynamicObject>;

type Body = http_body_util::Full<bytes::Bytes>;

// === impl Admission ===

impl tower::Service<Request<hyper::body::Incoming>> for Admission {
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<hyper::body::Incoming>) -> Self::Future {
        trace!(?req);
        if req.method() != http::Method::POST || req.uri().path() != "/" {
            return Box::pin(future::ok(
                Response::builder()
                    .status(http::StatusCode::NOT_FOUND)
                    .body(Body::default())
                    .expect("not found response must be valid"),
            ));
        }

        let admission = self.clone();
        Box::pin(async move {
            use bytes::Buf;
            let bytes = req.into_body().collect().await?.to_bytes();
            let review: Review = match serde_json::from_reader(bytes.reader()) {
                Ok(review) => review,
                Err(error) => {
                    warn!(%error, "Failed to parse request body");
                    return json_response(AdmissionResponse::invalid(error).into_review());
                }
            };
            trace!(?review);

            let rsp = match review.try_into() {
                Ok(req) => admission.admit(req).await,
                Err(error) => {
                    warn!(%error, "Invalid admission request");
                    AdmissionResponse::invalid(error)
                }
            };
            debug!(allowed = rsp.allowed, warnings = ?rsp.warnings);
            json_response(rsp.into_review())
        })
    }
}

impl Admission {
    pub fn new(reconciler: Reconciler<KubeStore>) -> Self {
        Self { reconciler }
    }

    async fn admit(self, req: AdmissionRequest) -> AdmissionResponse {
        let rsp = AdmissionResponse::from(&req);

        let event = match parse_event(req) {
            Ok(event) => event,
            Err(error) => {
                info!(%error, "Failed to parse pod");
                return rsp.deny(error);
            }
        };

        let span = info_span!(
            "admission",
            ns = %event.pod.namespace,
            name = %event.pod.name,
            op = event.operation.as_str()
        );
        let decision = self.reconciler.admit(event).instrument(span).await;
        respond(rsp, decision)
    }
}

/// Extracts the pod an admission request concerns. Deletions carry the pod
/// as the old object.
fn parse_event(req: AdmissionRequest) -> Result<AdmissionEvent> {
    let operation = match req.operation {
        admission::Operation::Create => Operation::Create,
        admission::Operation::Update => Operation::Update,
        admission::Operation::Delete => Operation::Delete,
        admission::Operation::Connect => Operation::Other,
    };

    let pod = match operation {
        Operation::Delete => req.old_object,
        _ => req.object,
    }
    .ok_or_else(|| anyhow!("admission request missing pod"))?;

    let mut pod = PodSnapshot::from(pod);
    if pod.name.is_empty() {
        pod.name = req.name;
    }
    if pod.namespace.is_empty() {
        pod.namespace = req.namespace.unwrap_or_default();
    }

    Ok(AdmissionEvent { operation, pod })
}

fn respond(rsp: AdmissionResponse, decision: Decision) -> AdmissionResponse {
    let Decision {
        allowed,
        reason,
        warnings,
    } = decision;

    let mut rsp = if allowed {
        rsp
    } else {
        rsp.deny(reason.unwrap_or_default())
    };
    if !warnings.is_empty() {
        rsp.warnings = Some(warnings);
    }
    rsp
}

fn json_response(rsp: AdmissionReview) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(&rsp)?;
    Ok(Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("admission review response must be valid"))
}
