//! Networked client for the daemon control channel.
//!
//! Connections are short-lived: one TCP+TLS dial per command batch, framed
//! msgpack both ways. The client authenticates with the same self-signed
//! certificate the daemon generated; enrollment is copying two PEM files.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use crate::artifact::Artifact;
use crate::daemon::db::{Job, JobFilter, JobStatus};
use crate::daemon::protocol::{read_frame, write_frame, LogArtifact, Request, Response};
use crate::daemon::server::{load_certs, load_key, TLS_NAME};
use crate::kernel::{KernelConfig, KernelInfo};
use crate::paths::ForgePaths;
use crate::runner::{select_kernels, RunSummary, SelectOpts};

pub struct Client {
    host: String,
    port: u16,
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl Client {
    /// Build a client from the local TLS material.
    pub fn new(paths: &ForgePaths, host: &str, port: u16) -> Result<Self> {
        let certs = load_certs(&paths.tls_cert())?;
        let key = load_key(&paths.tls_key())?;

        let mut roots = RootCertStore::empty();
        for cert in &certs {
            roots.add(cert.clone()).context("trust daemon certificate")?;
        }

        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)
            .context("assemble client TLS config")?;

        Ok(Self {
            host: host.to_string(),
            port,
            connector: TlsConnector::from(Arc::new(config)),
            server_name: ServerName::try_from(TLS_NAME)
                .context("invalid TLS server name")?
                .to_owned(),
        })
    }

    async fn connect(&self) -> Result<TlsStream<TcpStream>> {
        let tcp = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .with_context(|| format!("connect to daemon at {}:{}", self.host, self.port))?;
        self.connector
            .connect(self.server_name.clone(), tcp)
            .await
            .context("TLS handshake with daemon")
    }

    async fn round_trip(&self, request: Request) -> Result<Response> {
        let mut stream = self.connect().await?;
        write_frame(&mut stream, &request).await?;
        let response: Response = read_frame(&mut stream).await?;
        if let Response::Error { message } = response {
            bail!("daemon: {message}");
        }
        Ok(response)
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    pub async fn add_job(
        &self,
        repo: &str,
        commit: &str,
        group_uuid: &str,
        artifact: Artifact,
        kernel: KernelInfo,
    ) -> Result<String> {
        match self
            .round_trip(Request::AddJob {
                repo: repo.into(),
                commit: commit.into(),
                group_uuid: group_uuid.into(),
                artifact,
                kernel,
            })
            .await?
        {
            Response::JobAdded { uuid } => Ok(uuid),
            other => bail!("unexpected response to AddJob: {other:?}"),
        }
    }

    pub async fn jobs(&self, filter: JobFilter) -> Result<Vec<Job>> {
        match self.round_trip(Request::ListJobs { filter }).await? {
            Response::Jobs { jobs } => Ok(jobs),
            other => bail!("unexpected response to ListJobs: {other:?}"),
        }
    }

    pub async fn job_status(&self, uuid: &str) -> Result<JobStatus> {
        match self
            .round_trip(Request::JobStatus { uuid: uuid.into() })
            .await?
        {
            Response::JobStatus { status } => Ok(status),
            other => bail!("unexpected response to JobStatus: {other:?}"),
        }
    }

    pub async fn job_logs(&self, uuid: &str) -> Result<Vec<LogArtifact>> {
        match self
            .round_trip(Request::JobLogs { uuid: uuid.into() })
            .await?
        {
            Response::JobLogs { logs } => Ok(logs),
            other => bail!("unexpected response to JobLogs: {other:?}"),
        }
    }

    pub async fn add_repo(&self, name: &str) -> Result<()> {
        match self
            .round_trip(Request::AddRepo { name: name.into() })
            .await?
        {
            Response::RepoAdded { .. } => Ok(()),
            other => bail!("unexpected response to AddRepo: {other:?}"),
        }
    }

    pub async fn repos(&self) -> Result<Vec<String>> {
        match self.round_trip(Request::ListRepos).await? {
            Response::Repos { names } => Ok(names),
            other => bail!("unexpected response to ListRepos: {other:?}"),
        }
    }

    pub async fn kernels(&self) -> Result<Vec<KernelInfo>> {
        match self.round_trip(Request::Kernels).await? {
            Response::Kernels { kernels } => Ok(kernels),
            other => bail!("unexpected response to Kernels: {other:?}"),
        }
    }

    // -----------------------------------------------------------------------
    // Matrix submission
    // -----------------------------------------------------------------------

    /// Expand the artifact's matrix against the daemon's kernel list and
    /// queue one job per (kernel, run). Returns the group uuid tying them
    /// together and the number of jobs queued.
    pub async fn submit_matrix(
        &self,
        repo: &str,
        commit: &str,
        artifact: &Artifact,
        select: &SelectOpts,
        runs: u32,
    ) -> Result<(String, usize)> {
        let config = KernelConfig {
            kernels: self.kernels().await?,
        };
        let kernels = select_kernels(artifact, &config, select)?;

        let group_uuid = uuid::Uuid::new_v4().to_string();
        let mut queued = 0;
        for kernel in kernels {
            for _ in 0..runs.max(1) {
                let uuid = self
                    .add_job(repo, commit, &group_uuid, artifact.clone(), kernel.clone())
                    .await?;
                debug!(uuid, kernel = %kernel.slug(), "job queued");
                queued += 1;
            }
        }

        info!(group = %group_uuid, jobs = queued, "matrix submitted");
        Ok((group_uuid, queued))
    }

    /// Poll a job group until every member is terminal.
    pub async fn watch_group(&self, group_uuid: &str, interval: Duration) -> Result<RunSummary> {
        loop {
            let jobs = self
                .jobs(JobFilter {
                    group_uuid: Some(group_uuid.into()),
                    ..JobFilter::default()
                })
                .await?;
            if jobs.is_empty() {
                bail!("job group {group_uuid} is unknown to the daemon");
            }

            let done = jobs.iter().filter(|j| j.status.terminal()).count();
            info!(group = %group_uuid, done, total = jobs.len(), "group progress");

            if done == jobs.len() {
                let success = jobs
                    .iter()
                    .filter(|j| j.status == JobStatus::Success)
                    .count() as u64;
                return Ok(RunSummary {
                    overall: jobs.len() as u64,
                    success,
                    internal_errors: 0,
                });
            }
            tokio::time::sleep(interval).await;
        }
    }

    // -----------------------------------------------------------------------
    // Git proxy
    // -----------------------------------------------------------------------

    /// Listen on a local port and tunnel each connection to the daemon's
    /// git daemon through raw mode, so plain `git push git://localhost:…`
    /// works against the remote repos.
    pub async fn git_proxy(&self, local_port: u16) -> Result<()> {
        let listener = TcpListener::bind(("127.0.0.1", local_port))
            .await
            .with_context(|| format!("bind local git proxy port {local_port}"))?;
        info!(port = local_port, "git proxy listening");

        loop {
            let (mut local, peer) = listener.accept().await?;
            debug!(%peer, "git proxy connection");

            let mut remote = self.connect().await?;
            write_frame(&mut remote, &Request::RawMode).await?;
            match read_frame::<_, Response>(&mut remote).await? {
                Response::RawModeOk => {}
                other => bail!("unexpected response to RawMode: {other:?}"),
            }

            tokio::spawn(async move {
                if let Err(e) = tokio::io::copy_bidirectional(&mut local, &mut remote).await {
                    debug!(error = %e, "git proxy stream closed");
                }
            });
        }
    }
}
