use hub_ws::{ConnectionParameters, EventFilter, HubConfig, HubConnection, HubEvent, event_handler};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn usage() -> &'static str {
    "listen_events\n\
  Connects to a hub, subscribes to every event and logs them until Ctrl-C.\n\
\n\
USAGE:\n\
  HUB_URL=http://homeassistant.local:8123 HUB_TOKEN=<long-lived token> \\\n\
  cargo run --example listen_events -- [--type <event_type>]\n\
"
}

fn filter_from_args() -> Result<EventFilter, String> {
    let mut args = std::env::args().skip(1);
    let mut filter = EventFilter::Any;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--type" => {
                let event_type = args.next().ok_or("--type needs a value")?;
                filter = EventFilter::event_type(event_type);
            }
            "-h" | "--help" => return Err(usage().to_string()),
            other => return Err(format!("unknown argument {other}\n\n{}", usage())),
        }
    }
    Ok(filter)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,hub_ws=debug")),
        )
        .init();

    let filter = filter_from_args()?;
    let base_url = std::env::var("HUB_URL").map_err(|_| usage())?;
    let token = std::env::var("HUB_TOKEN").map_err(|_| usage())?;
    let params = ConnectionParameters::from_base_url(&base_url, token)?;

    let conn = HubConnection::tungstenite(HubConfig::new())?;
    let shutdown = CancellationToken::new();
    conn.connect(params, -1, Some(shutdown.clone())).await?;
    info!(version = conn.server_version().as_deref().unwrap_or("unknown"), "connected");

    let handler = event_handler(|event: &HubEvent| {
        info!(
            subscription = event.subscription_id,
            event_type = event.event_type().unwrap_or("?"),
            payload = ?event.payload,
            "event"
        );
    });
    conn.add_handler(filter.clone(), handler.clone(), &shutdown).await?;

    let mut states = conn.state_changes();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            state = states.recv() => match state {
                Ok(state) => info!(%state, "connection state"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => info!(skipped, "state changes skipped"),
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    if let Err(err) = conn.remove_handler(&filter, &handler, &CancellationToken::new()).await {
        error!(error = %err, "unsubscribe failed");
    }
    conn.dispose().await?;
    info!(dropped = conn.dropped_event_count(), "bye");
    Ok(())
}
