//! Mutually-authenticated TLS control channel.
//!
//! One self-signed certificate, generated on first start, doubles as the CA
//! for both directions: the daemon presents it as its server identity and
//! only accepts clients whose certificate chains to it. Copying the two PEM
//! files to another machine is the whole enrollment story.

use std::io::BufReader;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::Command;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::daemon::db::Db;
use crate::daemon::protocol::{try_read_frame, write_frame, LogArtifact, Request, Response};
use crate::daemon::{db::Job, db::JobStatus, GIT_PORT};
use crate::kernel::KernelConfig;
use crate::paths::ForgePaths;

/// DNS name baked into the self-signed certificate; clients dial by address
/// but verify against this name.
pub const TLS_NAME: &str = "modforge";

// ---------------------------------------------------------------------------
// TLS material
// ---------------------------------------------------------------------------

/// Generate the shared self-signed certificate on first start.
pub async fn ensure_tls_material(paths: &ForgePaths) -> Result<()> {
    let cert = paths.tls_cert();
    let key = paths.tls_key();
    if cert.exists() && key.exists() {
        return Ok(());
    }

    info!(cert = %cert.display(), "generating TLS certificate");
    let output = Command::new("openssl")
        .args(["req", "-x509", "-newkey", "rsa:4096", "-nodes", "-days", "3650"])
        .arg("-keyout")
        .arg(&key)
        .arg("-out")
        .arg(&cert)
        .arg("-subj")
        .arg(format!("/CN={TLS_NAME}"))
        .arg("-addext")
        .arg(format!("subjectAltName=DNS:{TLS_NAME}"))
        .stdin(Stdio::null())
        .output()
        .await
        .context("failed to spawn openssl")?;

    if !output.status.success() {
        bail!(
            "openssl certificate generation failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

pub fn load_certs(path: &std::path::Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("open certificate {}", path.display()))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<_, _>>()
        .context("parse certificate")?;
    if certs.is_empty() {
        bail!("no certificates in {}", path.display());
    }
    Ok(certs)
}

pub fn load_key(path: &std::path::Path) -> Result<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("open private key {}", path.display()))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .context("parse private key")?
        .with_context(|| format!("no private key in {}", path.display()))
}

fn server_tls_config(paths: &ForgePaths) -> Result<ServerConfig> {
    let certs = load_certs(&paths.tls_cert())?;
    let key = load_key(&paths.tls_key())?;

    // The server cert is also the only trusted client CA.
    let mut roots = RootCertStore::empty();
    for cert in &certs {
        roots
            .add(cert.clone())
            .context("add certificate to client trust store")?;
    }
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .context("build client certificate verifier")?;

    ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .context("assemble server TLS config")
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

struct HandlerCtx {
    db: Db,
    kernels: KernelConfig,
    repos_dir: PathBuf,
    daemon_logs: PathBuf,
}

pub struct Listener {
    tcp: TcpListener,
    acceptor: TlsAcceptor,
    ctx: Arc<HandlerCtx>,
}

impl Listener {
    pub async fn bind(
        paths: &ForgePaths,
        db: Db,
        kernels: KernelConfig,
        port: u16,
    ) -> Result<Self> {
        let config = server_tls_config(paths)?;
        let tcp = TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("bind control port {port}"))?;

        Ok(Self {
            tcp,
            acceptor: TlsAcceptor::from(Arc::new(config)),
            ctx: Arc::new(HandlerCtx {
                db,
                kernels,
                repos_dir: paths.repos.clone(),
                daemon_logs: paths.daemon_logs.clone(),
            }),
        })
    }

    pub async fn serve(self, cancel: CancellationToken) -> Result<()> {
        loop {
            let (stream, peer) = tokio::select! {
                accepted = self.tcp.accept() => accepted.context("accept control connection")?,
                _ = cancel.cancelled() => return Ok(()),
            };

            let acceptor = self.acceptor.clone();
            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                debug!(%peer, "control connection");
                match acceptor.accept(stream).await {
                    Ok(tls) => {
                        if let Err(e) = handle_connection(tls, ctx).await {
                            debug!(%peer, error = %format!("{e:#}"), "connection closed");
                        }
                    }
                    Err(e) => warn!(%peer, error = %e, "TLS handshake failed"),
                }
            });
        }
    }
}

async fn handle_connection<S>(mut stream: S, ctx: Arc<HandlerCtx>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let request: Request = match try_read_frame(&mut stream).await {
            // Clients hang up between commands; that's a clean close.
            Ok(None) => return Ok(()),
            Ok(Some(request)) => request,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "dropping connection on malformed frame");
                return Err(e);
            }
        };

        if matches!(request, Request::RawMode) {
            write_frame(&mut stream, &Response::RawModeOk).await?;
            return tunnel_to_git(stream).await;
        }

        let response = match dispatch(&ctx, request).await {
            Ok(response) => response,
            Err(e) => Response::Error {
                message: format!("{e:#}"),
            },
        };
        write_frame(&mut stream, &response).await?;
    }
}

/// Splice the rest of the connection into the local git daemon, so clients
/// can push/fetch through the single authenticated port.
async fn tunnel_to_git<S>(mut stream: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut git = TcpStream::connect(("127.0.0.1", GIT_PORT))
        .await
        .context("connect to local git daemon")?;
    let (to_git, from_git) = tokio::io::copy_bidirectional(&mut stream, &mut git)
        .await
        .context("git tunnel")?;
    debug!(to_git, from_git, "git tunnel closed");
    Ok(())
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn dispatch(ctx: &HandlerCtx, request: Request) -> Result<Response> {
    match request {
        Request::AddJob {
            repo,
            commit,
            group_uuid,
            artifact,
            kernel,
        } => add_job(ctx, repo, commit, group_uuid, artifact, kernel),
        Request::ListJobs { filter } => Ok(Response::Jobs {
            jobs: ctx.db.jobs(&filter)?,
        }),
        Request::JobStatus { uuid } => {
            let job = ctx
                .db
                .job_by_uuid(&uuid)?
                .with_context(|| format!("no job with uuid {uuid}"))?;
            Ok(Response::JobStatus { status: job.status })
        }
        Request::JobLogs { uuid } => job_logs(ctx, &uuid),
        Request::AddRepo { name } => add_repo(ctx, &name).await,
        Request::ListRepos => Ok(Response::Repos {
            names: ctx.db.repos()?,
        }),
        Request::Kernels => Ok(Response::Kernels {
            kernels: ctx.kernels.kernels.clone(),
        }),
        // Intercepted in handle_connection; a client resending it mid-stream
        // is a protocol violation.
        Request::RawMode => Ok(Response::Error {
            message: "raw mode must be the first request on a connection".into(),
        }),
    }
}

fn add_job(
    ctx: &HandlerCtx,
    repo: String,
    commit: String,
    group_uuid: String,
    artifact: crate::artifact::Artifact,
    kernel: crate::kernel::KernelInfo,
) -> Result<Response> {
    if commit.trim().is_empty() {
        bail!("job commit must not be empty");
    }
    if !ctx.db.repo_exists(&repo)? {
        bail!("unknown repo {repo:?}");
    }

    // Identifiers are assigned here, never trusted from the wire.
    let uuid = uuid::Uuid::new_v4().to_string();
    let job = Job {
        id: 0,
        uuid: uuid.clone(),
        group_uuid,
        repo,
        commit,
        artifact,
        kernel,
        status: JobStatus::New,
        created: chrono::Utc::now(),
        started: None,
        finished: None,
    };
    ctx.db.add_job(job)?;
    Ok(Response::JobAdded { uuid })
}

async fn add_repo(ctx: &HandlerCtx, name: &str) -> Result<Response> {
    if name.is_empty()
        || name.contains('/')
        || name.contains("..")
        || name.split_whitespace().count() != 1
    {
        bail!("invalid repo name {name:?}");
    }
    if ctx.db.repo_exists(name)? {
        bail!("repo {name:?} already exists");
    }

    let path = ctx.repos_dir.join(name);
    let output = Command::new("git")
        .arg("init")
        .arg("--bare")
        .arg("--quiet")
        .arg(&path)
        .output()
        .await
        .context("failed to spawn git init")?;
    if !output.status.success() {
        bail!(
            "git init --bare failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    ctx.db.add_repo(name, &path.display().to_string())?;
    Ok(Response::RepoAdded { name: name.into() })
}

fn job_logs(ctx: &HandlerCtx, uuid: &str) -> Result<Response> {
    let dir = ctx.daemon_logs.join(uuid);
    if !dir.is_dir() {
        bail!("no logs for job {uuid}");
    }

    let mut logs = Vec::new();
    let mut entries: Vec<_> = std::fs::read_dir(&dir)?
        .collect::<std::result::Result<_, _>>()
        .context("list job log directory")?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        if !entry.file_type()?.is_file() {
            continue;
        }
        logs.push(LogArtifact {
            name: entry.file_name().to_string_lossy().into_owned(),
            content: std::fs::read_to_string(entry.path()).unwrap_or_default(),
        });
    }
    Ok(Response::JobLogs { logs })
}
