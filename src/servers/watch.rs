use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

use crate::middleware::InterceptorChain;
use crate::proto::watch_server::Watch;
use crate::proto::{WatchRequest, WatchResponse};
use crate::storage::Watcher;

const WATCH: &str = "/base.v1.Watch/Watch";

/// Relationship change feed. Goes through the streaming interceptor chain.
///
/// Open feeds end once `drain` fires, so a graceful stop does not wait on them.
pub struct WatchService {
    watcher: Arc<dyn Watcher>,
    chain: InterceptorChain,
    drain: CancellationToken,
}

impl WatchService {
    /// Creates the service over a change source.
    pub fn new(
        watcher: Arc<dyn Watcher>,
        chain: InterceptorChain,
        drain: CancellationToken,
    ) -> Self {
        Self {
            watcher,
            chain,
            drain,
        }
    }
}

#[tonic::async_trait]
impl Watch for WatchService {
    type WatchStream = BoxStream<'static, Result<WatchResponse, Status>>;

    async fn watch(
        &self,
        request: Request<WatchRequest>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        let watcher = Arc::clone(&self.watcher);
        let drain = self.drain.clone();
        self.chain
            .stream(WATCH, request, move |req| async move {
                let changes = watcher.watch(&req.tenant_id, &req.snap_token).await?;
                let responses: Self::WatchStream = changes
                    .map(|item| {
                        item.map(|changes| WatchResponse {
                            changes: Some(changes),
                        })
                        .map_err(Status::from)
                    })
                    .take_until(drain.cancelled_owned())
                    .boxed();
                Ok::<_, Status>(responses)
            })
            .await
    }
}
