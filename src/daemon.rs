//! Wires the control plane together.
//!
//! ```text
//! Publisher ◄── Trainer (shows publish reap/updated/...)
//!     │              ▲
//!     │ show.*       │ stop_show / start_show / terminate
//!     ▼              │
//! Subscriber ──► FlappingDetector ──► ControlClient ──► Controller
//! ```
//!
//! The controller loop runs on the calling thread. The detector's client
//! connects lazily, so it can be built before the loop starts polling.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::client::ControlClient;
use crate::config::{FlappingSettings, ProjectConfig};
use crate::controller::{Controller, RouterEndpoint};
use crate::flapping::{FlappingDetector, RunningDetector};
use crate::log::ExecutionLog;
use crate::protocol::is_error;
use crate::pubsub::{EventSink, Publisher, SHOW_NAMESPACE, Subscriber};
use crate::target::Reply;
use crate::trainer::Trainer;

/// A bound supervisor whose controller loop has not started yet.
pub struct Daemon {
    controller: Controller<Trainer>,
    publisher: Arc<Publisher>,
    detector: Option<RunningDetector>,
}

impl Daemon {
    /// Bind both endpoints, start the flapping detector if enabled, then
    /// start the configured shows.
    pub fn bind(config: &ProjectConfig, stop: Arc<AtomicBool>) -> Result<Self> {
        let publisher = Arc::new(
            Publisher::bind(config.pubsub.endpoint.as_str()).with_context(|| {
                format!("failed to bind pubsub endpoint {}", config.pubsub.endpoint)
            })?,
        );
        let events: Arc<dyn EventSink> = publisher.clone();

        let endpoint = RouterEndpoint::bind(config.controller.endpoint.as_str()).with_context(|| {
            format!("failed to bind controller endpoint {}", config.controller.endpoint)
        })?;
        let trainer = Trainer::new(events, Arc::clone(&stop));
        let mut controller = Controller::new(endpoint, trainer, config.controller.timeout(), stop);

        let detector = if config.flapping.enabled {
            let running = spawn_detector(
                &config.flapping,
                controller.local_addr(),
                publisher.local_addr(),
            )?;
            controller.registry_mut().attach_flapping(running.handle());
            Some(running)
        } else {
            info!("flapping detection disabled");
            None
        };

        for show in &config.shows {
            match controller
                .registry_mut()
                .add_show(&show.name, show.options.clone())
            {
                Ok(Reply::Text(reply)) if is_error(&reply) => {
                    warn!(show = %show.name, reply = %reply, "show not added");
                }
                Ok(_) => {}
                Err(e) => warn!(show = %show.name, error = %e, "show failed to start"),
            }
        }

        Ok(Self {
            controller,
            publisher,
            detector,
        })
    }

    pub fn control_addr(&self) -> SocketAddr {
        self.controller.local_addr()
    }

    pub fn pubsub_addr(&self) -> SocketAddr {
        self.publisher.local_addr()
    }

    /// Run the controller loop until the stop flag is raised, then tear
    /// everything down: detector first, so stopping shows cannot look like
    /// flapping.
    pub fn run(self) -> Result<()> {
        let Daemon {
            mut controller,
            publisher,
            detector,
        } = self;

        let outcome = controller.run().context("controller loop failed");

        if let Some(detector) = detector {
            detector.stop();
        }
        let mut trainer = controller.into_registry();
        trainer.stop_all(true);
        publisher.close();
        info!("supervisor stopped");

        outcome
    }
}

fn spawn_detector(
    settings: &FlappingSettings,
    control_addr: SocketAddr,
    pubsub_addr: SocketAddr,
) -> Result<RunningDetector> {
    let client = ControlClient::new(control_addr.to_string()).with_timeout(settings.call_timeout());
    let mut detector = FlappingDetector::new(Arc::new(client), settings.check_delay());
    if let Some(path) = &settings.audit_log {
        let audit = ExecutionLog::new(path)?;
        info!(path = %audit.path().display(), "flapping audit log enabled");
        detector = detector.with_audit(Arc::new(audit));
    }

    let prefix = format!("{SHOW_NAMESPACE}.");
    let subscriber = Subscriber::connect(pubsub_addr, &prefix)
        .context("failed to subscribe the flapping detector to show events")?;
    let running = RunningDetector::spawn(detector, subscriber)
        .context("failed to start the flapping detector")?;
    info!(check_delay = ?settings.check_delay(), "flapping detector running");
    Ok(running)
}
