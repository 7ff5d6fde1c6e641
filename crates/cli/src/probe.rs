use crate::error::Error;
use flume::Sender;
use std::path::Path;
use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;
use tracing::{debug, info, warn};
use tracker::Event;

/// Upper bound on one raw record. The largest probe layout is well under
/// this; anything bigger means the framing is corrupt.
const MAX_RECORD_LEN: u32 = 4096;

/// Drain length-framed raw event records from the probe socket, decode each
/// one, and forward it on the event channel.
///
/// Returns when the probe side closes the socket or the consumer hangs up.
/// Undecodable records are skipped; a corrupt frame length is fatal for the
/// stream because resynchronization is impossible.
pub async fn pump_events(path: &Path, events: &Sender<Event>) -> Result<(), Error> {
    let mut stream = UnixStream::connect(path).await?;
    info!(path = %path.display(), "connected to probe socket");

    let mut buf = vec![0u8; MAX_RECORD_LEN as usize];
    loop {
        let len = match stream.read_u32_le().await {
            Ok(len) => len,
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("probe socket closed");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        if len == 0 || len > MAX_RECORD_LEN {
            return Err(Error::ProbeFrame(len));
        }

        let record = &mut buf[..len as usize];
        stream.read_exact(record).await?;
        match Event::parse(record) {
            Ok(event) => {
                if events.send_async(event).await.is_err() {
                    debug!("event channel closed");
                    return Ok(());
                }
            }
            Err(err) => warn!(%err, "undecodable probe record skipped"),
        }
    }
}
