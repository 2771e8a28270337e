use std::future::Future;
use std::net::SocketAddr;

use log::info;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use super::routes::{routes, FeedState};
use crate::error_handling::types::WebError;

/// HTTP live feed for external consumers.
pub struct WebServer {
    state: FeedState,
}

impl WebServer {
    pub fn new(state: FeedState) -> Self {
        Self { state }
    }

    /// Binds `addr` and serves until `shutdown` resolves.
    ///
    /// Binding happens before this returns so an unusable address is reported
    /// as a startup error; the returned address carries the real port.
    pub async fn start<S>(self, addr: SocketAddr, shutdown: S) -> Result<(SocketAddr, JoinHandle<()>), WebError>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| WebError::Bind { addr, source })?;
        let local = listener
            .local_addr()
            .map_err(|source| WebError::Bind { addr, source })?;
        info!("[{}] Live feed listening on http://{}", self.state.interface, local);

        let filter = routes(self.state);
        let handle = tokio::spawn(async move {
            warp::serve(filter)
                .incoming(listener)
                .graceful(shutdown)
                .run()
                .await;
            info!("Live feed stopped");
        });
        Ok((local, handle))
    }
}
