use crate::{
    config::Config,
    console::{self, ConsoleState},
    correlation::{CallCorrelator, CorrelatorOption},
    repository::{create_repository, Repository},
    rtcp::RtcpReportService,
    server::{run_consumer, HepServer, HepServerOption},
    sip::{SipMessage, SipParser},
};
use anyhow::Result;
use chrono::Utc;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, select, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub struct AppStateInner {
    pub config: Arc<Config>,
    pub repository: Arc<dyn Repository>,
    pub rtcp: Arc<RtcpReportService>,
    pub correlator: Arc<CallCorrelator>,
    pub parser: Arc<SipParser>,
    pub token: CancellationToken,
}

pub type AppState = Arc<AppStateInner>;

pub struct AppStateBuilder {
    pub config: Option<Config>,
    pub repository: Option<Arc<dyn Repository>>,
    pub token: Option<CancellationToken>,
}

impl Default for AppStateBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AppStateBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            repository: None,
            token: None,
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_repository(mut self, repository: Arc<dyn Repository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    pub async fn build(self) -> Result<AppState> {
        let config = Arc::new(self.config.unwrap_or_default());
        let token = self.token.unwrap_or_else(CancellationToken::new);

        let repository = match self.repository {
            Some(repository) => repository,
            None => create_repository(&config.repository).await?,
        };
        let rtcp = Arc::new(RtcpReportService::new(Duration::from_secs(
            config.rtcp_report_ttl_secs,
        )));
        let correlator = Arc::new(CallCorrelator::new(
            repository.clone(),
            rtcp.clone(),
            CorrelatorOption {
                hangup_codes: config.hangup_codes.clone(),
                unanswered_timeout: Duration::from_secs(config.unanswered_timeout_secs),
                answered_timeout: Duration::from_secs(config.answered_timeout_secs),
            },
        ));
        let parser = Arc::new(SipParser::new(
            &config.session_id_header,
            config.discard_methods.as_slice(),
        ));

        Ok(Arc::new(AppStateInner {
            config,
            repository,
            rtcp,
            correlator,
            parser,
            token,
        }))
    }
}

/// Listeners bound and ready, nothing received yet.
pub struct App {
    pub state: AppState,
    server: HepServer,
    listener: TcpListener,
    receiver: mpsc::Receiver<SipMessage>,
}

impl App {
    pub async fn bind(state: AppState) -> Result<Self> {
        let config = state.config.clone();
        let (sender, receiver) = mpsc::channel(config.queue_size.max(1));

        let server = HepServer::bind(
            config.udp_socket_addr()?,
            HepServerOption {
                max_packet_length: config.max_packet_length,
                min_packet_length: config.min_packet_length,
                read_timeout: config.read_timeout(),
            },
            state.parser.clone(),
            state.rtcp.clone(),
            sender,
            state.token.child_token(),
        )
        .await?;

        let addr = config.http_socket_addr()?;
        let listener = match TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind to {}: {}", addr, e);
                return Err(anyhow::anyhow!("Failed to bind to {}: {}", addr, e));
            }
        };
        Ok(Self {
            state,
            server,
            listener,
            receiver,
        })
    }

    pub fn udp_addr(&self) -> Result<SocketAddr> {
        self.server.local_addr()
    }

    pub fn http_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> Result<()> {
        let App {
            state,
            server,
            listener,
            receiver,
        } = self;
        let token = state.token.clone();

        info!(
            udp = %server.local_addr()?,
            http = %listener.local_addr()?,
            "sipmonitor started"
        );
        tokio::spawn(run_consumer(
            receiver,
            state.correlator.clone(),
            token.child_token(),
        ));
        spawn_sweeps(&state);

        let router = console::router(ConsoleState {
            repository: state.repository.clone(),
            correlator: state.correlator.clone(),
        });
        let http_task =
            axum::serve(listener, router).with_graceful_shutdown(token.clone().cancelled_owned());

        let result = select! {
            http_result = http_task => {
                http_result.map_err(|e| anyhow::anyhow!("Server error: {}", e))
            }
            hep_result = server.serve() => {
                hep_result
            }
            _ = token.cancelled() => {
                info!("Application shutting down due to cancellation");
                Ok(())
            }
        };
        if let Err(ref e) = result {
            error!("{}", e);
        }
        token.cancel();
        result
    }
}

fn spawn_sweeps(state: &AppState) {
    let correlator = state.correlator.clone();
    let token = state.token.clone();
    let period = Duration::from_secs(state.config.call_flush_interval_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    correlator.flush_expired(Utc::now()).await;
                }
            }
        }
    });

    let rtcp = state.rtcp.clone();
    let token = state.token.clone();
    let period = Duration::from_secs(state.config.rtcp_cleanup_interval_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    rtcp.cleanup_expired(Utc::now()).await;
                }
            }
        }
    });
}
