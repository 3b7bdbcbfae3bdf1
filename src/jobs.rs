use std::net::SocketAddr;
use std::time::SystemTime;

use tokio::sync::mpsc;

use crate::identity::PeerId;

/// A unit of work handed from one service to another. Jobs are plain owned
/// values: the producer gives up ownership on send and the consumer drops
/// the job after processing, so no two services ever share one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    /// A peer id was seen for the first time since it entered the registry.
    /// Consumed by the listing client, which walks the peer's tree once per
    /// introduction rather than once per discovery packet.
    PeerSeen {
        peer_id: PeerId,
        addr: SocketAddr,
        seen: SystemTime,
    },
    /// A remote file is missing locally. Consumed by the file client.
    /// `path` is relative to the sync root on both ends.
    DownloadFile { addr: SocketAddr, path: String },
}

impl Job {
    /// Tag used in log lines and unknown-job warnings.
    pub fn kind(&self) -> &'static str {
        match self {
            Job::PeerSeen { .. } => "peer_seen",
            Job::DownloadFile { .. } => "download_file",
        }
    }
}

pub type JobReceiver = mpsc::UnboundedReceiver<Job>;

/// Handle other services use to push into one service's private queue.
#[derive(Debug, Clone)]
pub struct JobSender {
    tx: mpsc::UnboundedSender<Job>,
}

impl JobSender {
    /// Never blocks. If the consuming service has already shut down the job
    /// is silently dropped; during teardown that is the correct outcome.
    pub fn send(&self, job: Job) {
        if let Err(e) = self.tx.send(job) {
            tracing::debug!("dropping {} job, queue is closed", e.0.kind());
        }
    }
}

/// One queue per service that accepts cross-service input. Created at
/// service start; dropping the receiver ends the queue's life.
pub fn queue() -> (JobSender, JobReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (JobSender { tx }, rx)
}
