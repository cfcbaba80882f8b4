use crate::config::BroadcastSettings;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const ACTION: &str = "statement_scan.GMAIL_DATA";

/// One-way signal to a local receiver, sent as a single JSON frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastSignal {
    pub action: String,
    pub component: String,
    pub extras: BTreeMap<String, String>,
}

impl BroadcastSignal {
    pub fn from_settings(settings: &BroadcastSettings) -> Self {
        Self {
            action: ACTION.to_string(),
            component: settings.component.clone(),
            extras: BTreeMap::from([(settings.extra_key.clone(), settings.extra_value.clone())]),
        }
    }
}

pub fn encode_frame(signal: &BroadcastSignal) -> Result<Vec<u8>> {
    let data = serde_json::to_vec(signal)?;
    let mut frame = Vec::with_capacity(data.len() + 4);
    frame.extend_from_slice(&(data.len() as u32).to_be_bytes());
    frame.extend_from_slice(&data);
    Ok(frame)
}

#[cfg(unix)]
pub async fn send(socket_path: &str, signal: &BroadcastSignal) -> Result<()> {
    let result = write_frame(socket_path, &encode_frame(signal)?).await;
    match &result {
        Ok(()) => tracing::info!("Broadcast {} sent to {}", signal.action, signal.component),
        Err(e) => tracing::error!("Error sending broadcast: {:#}", e),
    }
    result
}

#[cfg(unix)]
async fn write_frame(socket_path: &str, frame: &[u8]) -> Result<()> {
    use anyhow::Context;
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixStream;

    let mut stream = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("No receiver listening on {}", socket_path))?;
    stream.write_all(frame).await?;
    stream.shutdown().await?;
    Ok(())
}

#[cfg(not(unix))]
pub async fn send(_socket_path: &str, _signal: &BroadcastSignal) -> Result<()> {
    anyhow::bail!("Broadcast is not supported on this platform")
}
