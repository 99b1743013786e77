//! Process entry: configuration, platform connection, runtime and signals.
//!
//! `SIGINT`/`SIGTERM` shut down cleanly. `SIGHUP` reloads the configuration
//! file, reconnects to the platform and restarts the broker session.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::Config;
use crate::dispatch::{Component, Handled, HandlerResult, Invocation, Yield};
use crate::event::ChannelKey;
use crate::rest::client::RestClientConfig;
use crate::rest::{self, PlatformApi, RestClient};
use crate::runtime::{Runtime, RuntimeError, RuntimeHandle};
use crate::stomp::StompSessionFactory;
use crate::test_actions::TestActionServer;
use crate::utils::bootstrap::connect_platform;
use crate::utils::retry::platform_backoff;

/// App section enabling the echo component: `queue = <message destination>`.
pub const ECHO_SECTION: &str = "echo";

enum Control {
    Shutdown,
    Reload,
}

/// Component answering every action on `queue` with a summary of the event.
///
/// Useful for checking a deployment end to end.
pub fn echo_component(queue: &str) -> Component {
    Component::new("echo").on(
        ChannelKey::Actions(queue.to_string()),
        |invocation: &Invocation| -> HandlerResult {
            let event = invocation.event();
            let mut values = vec![Yield::Status(format!("Echo: {}", event.display_name()))];
            if let Some(incident) = event.incident_id() {
                values.push(Yield::Status(format!("incident {incident}")));
            }
            Ok(Handled::stream(values))
        },
    )
}

fn platform_client(config: &Config) -> Result<Arc<dyn PlatformApi>, RuntimeError> {
    let client = RestClient::new(RestClientConfig::from_options(&config.options)?)?;
    Ok(Arc::new(client))
}

fn listen_for_signals() -> std::io::Result<mpsc::UnboundedReceiver<Control>> {
    let (tx, rx) = mpsc::unbounded_channel();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate())?;
        let mut hup = signal(SignalKind::hangup())?;
        let tx = tx.clone();
        tokio::spawn(async move {
            loop {
                let control = tokio::select! {
                    Some(()) = term.recv() => Control::Shutdown,
                    Some(()) = hup.recv() => Control::Reload,
                    else => return,
                };
                if tx.send(control).is_err() {
                    return;
                }
            }
        });
    }

    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if tx.send(Control::Shutdown).is_err() {
                return;
            }
        }
    });
    Ok(rx)
}

async fn reload(handle: &RuntimeHandle) {
    let config = match Config::load(None) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Reload failed, keeping current configuration");
            return;
        }
    };
    let api = match platform_client(&config) {
        Ok(api) => api,
        Err(e) => {
            error!(error = %e, "Reload failed, keeping current configuration");
            return;
        }
    };
    match handle.reload(config, api).await {
        Ok(()) => info!("Configuration reloaded"),
        Err(e) => error!(error = %e, "Reload failed"),
    }
}

async fn join(task: JoinHandle<Result<(), RuntimeError>>) -> Result<(), RuntimeError> {
    task.await?
}

/// Run the connector with `components` until shutdown.
pub async fn run(components: Vec<Component>) -> Result<(), RuntimeError> {
    let config = Config::load(None)?;
    info!(path = ?config.path, options = ?config.options, "Configuration loaded");

    let api = platform_client(&config)?;
    let backoff = platform_backoff(config.options.max_connection_retries);
    let org = connect_platform(api.as_ref(), backoff).await?;
    let metadata = rest::load_metadata(api.as_ref(), &org).await?;

    let test_server = config
        .options
        .test_actions
        .then(|| (config.options.test_host.clone(), config.options.test_port));
    let echo = config
        .section(ECHO_SECTION)
        .and_then(|section| section.get("queue"))
        .map(|queue| echo_component(queue));

    let mut signals = listen_for_signals()?;
    let (runtime, handle) =
        Runtime::new(config, org, metadata, api, Arc::new(StompSessionFactory));
    let mut task = tokio::spawn(runtime.run());

    for component in components.into_iter().chain(echo) {
        if let Err(e) = handle.register(component).await {
            handle.shutdown();
            return match join(task).await {
                Err(fatal) => Err(fatal),
                Ok(()) => Err(e),
            };
        }
    }

    if let Some((host, port)) = test_server {
        let server = TestActionServer::bind(&host, port, handle.clone()).await?;
        tokio::spawn(server.run());
    }

    loop {
        tokio::select! {
            result = &mut task => return result?,
            control = signals.recv() => match control {
                Some(Control::Reload) => reload(&handle).await,
                Some(Control::Shutdown) | None => {
                    info!("Shutdown requested");
                    handle.shutdown();
                    return join(task).await;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ActionEvent, Envelope, TypedEvent};
    use crate::stomp::{Command, Frame};
    use serde_json::json;

    #[test]
    fn test_echo_component() {
        let component = echo_component("demo");
        assert_eq!(component.channels().collect::<Vec<_>>(), vec![&ChannelKey::Actions("demo".to_string())]);

        let event = TypedEvent::Action(ActionEvent {
            queue: "demo".to_string(),
            name: "ping".to_string(),
            action_id: Some(1),
            principal: None,
            workflow: None,
            envelope: Envelope::new(Frame::new(Command::Message), json!({"incident": {"id": 2095}})),
        });
        let invocation = Invocation::new(Arc::new(event), false, Arc::default());
        let Ok(Handled::Stream(stream)) = component.bindings()[0].handler.handle(&invocation) else {
            panic!("expected a stream");
        };
        assert_eq!(
            stream.collect::<Vec<_>>(),
            vec![
                Yield::Status("Echo: ping".to_string()),
                Yield::Status("incident 2095".to_string())
            ]
        );
    }
}
