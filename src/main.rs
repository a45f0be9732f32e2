use routegate::admin::{AdminServer, PKG_NAME, VERSION};
use routegate::appliance::ApplianceBackend;
use routegate::backend::{Backend, TemplateBackend};
use routegate::config::{BackendKind, Config};
use routegate::events;
use routegate::plugin::RouterPlugin;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("routegate=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("routegate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    info!(path = %config_path.display(), "Configuration loaded");
    log_settings(&config);

    let pid_file = config
        .controller
        .pid_file
        .as_deref()
        .map(PidFile::acquire)
        .transpose()?;

    let plugin = RouterPlugin::start(build_backend(&config)?)
        .await
        .map_err(|e| {
            error!(error = %e, "Backend initialization failed");
            e
        })?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (event_sender, dispatcher) = events::spawn(plugin, config.controller.queue_depth, shutdown_rx.clone());

    let admin_addr: SocketAddr = format!("{}:{}", config.controller.admin_bind, config.controller.admin_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid admin bind address {}: {}", config.controller.admin_bind, e))?;

    let admin_token = match &config.controller.admin_token {
        Some(token) => token.clone(),
        None => {
            let token = uuid::Uuid::new_v4().to_string();
            info!(token = %token, "No admin_token configured; generated one for this run");
            token
        }
    };

    let admin = AdminServer::new(admin_addr, event_sender, shutdown_rx, admin_token);
    let admin_task = tokio::spawn(async move {
        if let Err(e) = admin.run().await {
            error!(error = %e, "Admin server stopped with an error");
        }
    });

    wait_for_signal().await;
    let _ = shutdown_tx.send(true);

    // The dispatcher finishes the event in progress before it stops
    if tokio::time::timeout(SHUTDOWN_GRACE, async {
        let _ = admin_task.await;
        let _ = dispatcher.await;
    })
    .await
    .is_err()
    {
        warn!(grace_secs = SHUTDOWN_GRACE.as_secs(), "Shutdown grace period elapsed");
    }

    if let Some(pid_file) = pid_file {
        pid_file.release();
    }

    info!("Controller stopped");
    Ok(())
}

fn build_backend(config: &Config) -> anyhow::Result<Box<dyn Backend>> {
    let backend: Box<dyn Backend> = match config.controller.backend {
        BackendKind::Template => Box::new(TemplateBackend::new(&config.template)?),
        BackendKind::Appliance => Box::new(ApplianceBackend::connect(&config.appliance)?),
    };
    Ok(backend)
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGTERM; only Ctrl+C stops the controller");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGINT received, stopping"),
        _ = sigterm.recv() => info!("SIGTERM received, stopping"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Ctrl+C received, stopping");
}

fn log_settings(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting route controller");
    info!(
        backend = ?config.controller.backend,
        admin = %format!("{}:{}", config.controller.admin_bind, config.controller.admin_port),
        queue_depth = config.controller.queue_depth,
        "Controller settings"
    );
    match config.controller.backend {
        BackendKind::Template => info!(
            dir = %config.template.dir.display(),
            templates = config.template.templates.len(),
            reload_script = ?config.template.reload_script,
            default_certificate = ?config.template.default_certificate,
            "Template backend settings"
        ),
        BackendKind::Appliance => info!(
            host = %config.appliance.host,
            partition = %config.appliance.partition_path,
            http_vserver = ?config.appliance.http_vserver,
            https_vserver = ?config.appliance.https_vserver,
            insecure = config.appliance.insecure,
            request_timeout_secs = config.appliance.request_timeout_secs,
            "Appliance backend settings"
        ),
    }
}

/// PID file held for the lifetime of the controller.
///
/// On unix the file carries an exclusive `flock`, so a second controller
/// pointed at the same file refuses to start.
struct PidFile {
    path: PathBuf,
    _file: std::fs::File,
}

impl PidFile {
    fn acquire(path: &str) -> anyhow::Result<Self> {
        use std::io::Write;

        let path = PathBuf::from(path);
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        lock_exclusive(&file, &path)?;
        writeln!(&file, "{}", std::process::id())?;

        info!(path = %path.display(), "PID file locked");
        Ok(Self { path, _file: file })
    }

    fn release(self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to remove PID file");
        }
    }
}

#[cfg(unix)]
fn lock_exclusive(file: &std::fs::File, path: &Path) -> anyhow::Result<()> {
    use std::os::unix::io::AsRawFd;

    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.kind() == std::io::ErrorKind::WouldBlock {
        anyhow::bail!("{} is locked by another running controller", path.display());
    }
    Err(err.into())
}

#[cfg(not(unix))]
fn lock_exclusive(_file: &std::fs::File, _path: &Path) -> anyhow::Result<()> {
    Ok(())
}
