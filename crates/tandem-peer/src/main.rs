use anyhow::{Context, Result};
use tandem_peer::{Config, PeerConnection};
use tandem_protocol::SignalMessage;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Logs go to stderr; stdout carries the signaling messages
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tandem_peer=debug,tandem_media=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Config::load()?;
    let peer = PeerConnection::new(config);
    tracing::info!(peer = %peer.id(), "Starting Tandem peer...");

    peer.on_track(|track_type, mut stream| async move {
        let ssrc = stream.ssrc();
        tracing::info!(ssrc, %track_type, "Receiving stream");

        let mut packets = 0u64;
        while stream.recv().await.is_some() {
            packets += 1;
            if packets % 500 == 0 {
                tracing::debug!(ssrc, packets, dropped = stream.dropped(), "Stream progress");
            }
        }

        tracing::info!(ssrc, packets, dropped = stream.dropped(), "Stream ended");
    });

    let offer = peer.create_offer().await?;
    for failure in &offer.failures {
        tracing::warn!("Not advertised: {}", failure);
    }

    let message = SignalMessage::Offer { sdp: offer.sdp() };
    println!("{}", serde_json::to_string(&message)?);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let answer = tokio::select! {
        line = lines.next_line() => line.context("Failed to read answer from stdin")?,
        _ = tokio::signal::ctrl_c() => {
            peer.close().await;
            return Ok(());
        }
    };

    match answer {
        Some(line) => match serde_json::from_str::<SignalMessage>(&line)? {
            SignalMessage::Answer { sdp } => peer.set_remote_description(&sdp)?,
            SignalMessage::Offer { .. } => tracing::warn!("Expected an answer, ignoring offer"),
        },
        None => tracing::info!("No answer on stdin"),
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    peer.close().await;

    Ok(())
}
