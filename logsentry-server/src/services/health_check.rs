use std::sync::Arc;

use logsentry_system::{
    AsyncResponse, Controller, FromMessage, Interface, Receiver, Sender, Service,
};

use crate::store::Store;

/// Checks whether the server is alive and healthy based on its variant.
#[derive(Clone, Copy, Debug, serde::Deserialize)]
pub enum IsHealthy {
    /// Check if the server is alive at all.
    #[serde(rename = "live")]
    Liveness,
    /// Check if the server is in a state where the load balancer should route
    /// traffic to it.
    #[serde(rename = "ready")]
    Readiness,
}

/// Service interface for the [`IsHealthy`] message.
#[derive(Debug)]
pub struct HealthCheck(IsHealthy, Sender<bool>);

impl Interface for HealthCheck {}

impl FromMessage<IsHealthy> for HealthCheck {
    type Response = AsyncResponse<bool>;

    fn from_message(message: IsHealthy, sender: Sender<bool>) -> Self {
        Self(message, sender)
    }
}

/// Service implementing the [`HealthCheck`] interface.
#[derive(Debug)]
pub struct HealthCheckService {
    store: Arc<dyn Store>,
    is_shutting_down: bool,
}

impl HealthCheckService {
    /// Creates the service.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            is_shutting_down: false,
        }
    }

    async fn handle_is_healthy(&self, message: IsHealthy) -> bool {
        match message {
            IsHealthy::Liveness => true,
            IsHealthy::Readiness => {
                if self.is_shutting_down {
                    return false;
                }

                self.store.ping().await.is_ok()
            }
        }
    }
}

impl Service for HealthCheckService {
    type Interface = HealthCheck;

    fn spawn_handler(mut self, mut rx: Receiver<Self::Interface>) {
        tokio::spawn(async move {
            let mut shutdown = Controller::shutdown_handle();

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.notified() => self.is_shutting_down = true,
                    message = rx.recv() => match message {
                        Some(HealthCheck(message, sender)) => {
                            sender.send(self.handle_is_healthy(message).await)
                        }
                        None => break,
                    },
                }
            }
        });
    }

    fn name() -> &'static str {
        "health_check"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_healthy_when_store_responds() {
        let service = HealthCheckService::new(Arc::new(MemoryStore::new()));
        let addr = service.start();

        assert_eq!(addr.send(IsHealthy::Liveness).await, Ok(true));
        assert_eq!(addr.send(IsHealthy::Readiness).await, Ok(true));
    }
}
