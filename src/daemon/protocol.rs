//! Wire protocol between client and daemon.
//!
//! Every message is one length-prefixed frame: a big-endian `u32` payload
//! size followed by a msgpack document. Requests and responses are tagged
//! enums, so unknown or malformed commands fail at decode time instead of
//! dispatch time.

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::artifact::Artifact;
use crate::daemon::db::{Job, JobFilter, JobStatus};
use crate::kernel::KernelInfo;

/// Upper bound on a single frame; a console log is the largest payload.
pub const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// One named log artifact of a finished job (`build.log`, `console.log`, …).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogArtifact {
    pub name: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    /// Queue one (artifact, kernel) run against a commit of a known repo.
    AddJob {
        repo: String,
        commit: String,
        group_uuid: String,
        artifact: Artifact,
        kernel: KernelInfo,
    },
    ListJobs {
        filter: JobFilter,
    },
    JobStatus {
        uuid: String,
    },
    JobLogs {
        uuid: String,
    },
    /// Register a repo name; the daemon creates the bare repository.
    AddRepo {
        name: String,
    },
    ListRepos,
    /// The daemon's kernel list, for client-side matrix expansion.
    Kernels,
    /// Switch this connection into a raw byte tunnel to the git daemon.
    RawMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    JobAdded {
        uuid: String,
    },
    Jobs {
        jobs: Vec<Job>,
    },
    JobStatus {
        status: JobStatus,
    },
    JobLogs {
        logs: Vec<LogArtifact>,
    },
    RepoAdded {
        name: String,
    },
    Repos {
        names: Vec<String>,
    },
    Kernels {
        kernels: Vec<KernelInfo>,
    },
    /// Acknowledged; all further bytes on this connection are tunneled.
    RawModeOk,
    Error {
        message: String,
    },
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = rmp_serde::to_vec_named(message).context("encode frame")?;
    let len = u32::try_from(payload.len()).context("frame too large for u32 prefix")?;
    if len > MAX_FRAME_BYTES {
        bail!("frame of {len} bytes exceeds the {MAX_FRAME_BYTES} byte limit");
    }

    writer.write_u32(len).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    try_read_frame(reader)
        .await?
        .context("connection closed before a frame arrived")
}

/// Like [`read_frame`], but a connection closed before the length prefix
/// reads as `None`. Lets servers tell a client hanging up between commands
/// apart from a malformed or oversized frame.
pub async fn try_read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("read frame length"),
    };
    if len > MAX_FRAME_BYTES {
        bail!("peer announced a {len} byte frame, limit is {MAX_FRAME_BYTES}");
    }

    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .context("read frame payload")?;
    rmp_serde::from_slice(&payload)
        .context("decode frame")
        .map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_frames_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);

        let sent = Request::AddRepo {
            name: "kernel-exploits".into(),
        };
        write_frame(&mut client, &sent).await.unwrap();

        let received: Request = read_frame(&mut server).await.unwrap();
        match received {
            Request::AddRepo { name } => assert_eq!(name, "kernel-exploits"),
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[tokio::test]
    async fn responses_carry_structured_errors() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);

        write_frame(
            &mut server,
            &Response::Error {
                message: "no such repo".into(),
            },
        )
        .await
        .unwrap();

        let received: Response = read_frame(&mut client).await.unwrap();
        match received {
            Response::Error { message } => assert_eq!(message, "no such repo"),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn multiple_frames_on_one_stream_stay_separate() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);

        write_frame(&mut client, &Request::ListRepos).await.unwrap();
        write_frame(&mut client, &Request::Kernels).await.unwrap();

        let first: Request = read_frame(&mut server).await.unwrap();
        let second: Request = read_frame(&mut server).await.unwrap();
        assert!(matches!(first, Request::ListRepos));
        assert!(matches!(second, Request::Kernels));
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected_before_allocation() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        client.write_u32(MAX_FRAME_BYTES + 1).await.unwrap();
        let result: Result<Request> = read_frame(&mut server).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn clean_close_is_not_an_error_but_garbage_is() {
        // Peer hangs up before sending anything: a clean close.
        let (client, mut server) = tokio::io::duplex(1024);
        drop(client);
        let got: Option<Request> = try_read_frame(&mut server).await.unwrap();
        assert!(got.is_none());

        // Well-framed garbage: 0xc1 is never valid msgpack.
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_u32(4).await.unwrap();
        client.write_all(&[0xc1; 4]).await.unwrap();
        let result: Result<Option<Request>> = try_read_frame(&mut server).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn job_filter_round_trips_inside_a_request() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);

        let filter = JobFilter {
            group_uuid: Some("g".into()),
            status: Some(JobStatus::Waiting),
            ..JobFilter::default()
        };
        write_frame(&mut client, &Request::ListJobs { filter })
            .await
            .unwrap();

        let received: Request = read_frame(&mut server).await.unwrap();
        match received {
            Request::ListJobs { filter } => {
                assert_eq!(filter.group_uuid.as_deref(), Some("g"));
                assert_eq!(filter.status, Some(JobStatus::Waiting));
                assert!(filter.repo.is_none());
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }
}
