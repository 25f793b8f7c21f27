use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use mirra_core::{Obj, ObjKey};
use mirra_informer::{Handler, Informer};
use mirra_kubehub::KubeSource;

#[derive(Parser, Debug)]
#[command(name = "mirractl", version, about = "Mirra informer CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Initial sync timeout in seconds
    #[arg(long = "sync-timeout", global = true, default_value_t = 30)]
    sync_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover served resources (incl. CRDs)
    Discover,
    /// List cached objects for a GVK key after the initial sync
    Ls {
        /// GVK key, e.g. "v1/Pod" or "apps/v1/Deployment"
        gvk: String,
    },
    /// Watch a GVK and print +/~/- events until interrupted
    Watch {
        /// GVK key, e.g. "v1/Pod" or "apps/v1/Deployment"
        gvk: String,
    },
    /// Print one cached object as JSON
    Get {
        /// GVK key, e.g. "v1/Pod"
        gvk: String,
        /// Object name
        name: String,
    },
}

fn init_tracing() {
    let env = std::env::var("MIRRA_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("MIRRA_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid MIRRA_METRICS_ADDR; expected host:port");
        }
    }
}

/// Prints one line per event, kubectl-diff style.
struct PrintHandler;

impl Handler for PrintHandler {
    fn on_add(&self, obj: &Obj) {
        println!("+ {}", obj.key());
    }
    fn on_update(&self, _old: &Obj, new: &Obj) {
        println!("~ {}", new.key());
    }
    fn on_delete(&self, obj: &Obj) {
        println!("- {}", obj.key());
    }
}

async fn synced_informer(
    gvk: &str,
    namespace: Option<&str>,
    sync_timeout: u64,
    handler: Option<Arc<dyn Handler>>,
) -> Result<Informer> {
    let source = KubeSource::new(gvk, namespace).await?;
    let mut informer = Informer::new(Arc::new(source));
    if let Some(h) = handler {
        informer.register_handler(h)?;
    }
    informer.start()?;
    if !informer.wait_for_sync(Duration::from_secs(sync_timeout)).await {
        let _ = informer.stop().await;
        bail!("initial sync did not complete within {}s", sync_timeout);
    }
    Ok(informer)
}

/// Find one cached object by name. With a namespace the lookup is exact;
/// without one (all-namespaces source) the cache is scanned, and a name
/// appearing in several namespaces is an error rather than a guess.
fn lookup(items: &[Obj], namespace: Option<&str>, name: &str) -> Result<Obj> {
    if let Some(ns) = namespace {
        let key = ObjKey::new(Some(ns), name);
        return items
            .iter()
            .find(|o| o.key() == key)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("object not found in cache: {}", key));
    }
    let matches: Vec<&Obj> = items.iter().filter(|o| o.name == name).collect();
    match matches.as_slice() {
        [one] => Ok((*one).clone()),
        [] => bail!("object not found in cache: {}", name),
        many => {
            let namespaces: Vec<&str> =
                many.iter().filter_map(|o| o.namespace.as_deref()).collect();
            bail!(
                "name {} is ambiguous across namespaces [{}]; pass --ns",
                name,
                namespaces.join(", ")
            )
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Discover => {
            let kinds = mirra_kubehub::discover().await?;
            match cli.output {
                Output::Human => {
                    for k in kinds {
                        let scope = if k.namespaced { "namespaced" } else { "cluster" };
                        println!("{} • {}", k.gvk_key(), scope);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&kinds)?),
            }
        }
        Commands::Ls { gvk } => {
            let mut informer =
                synced_informer(&gvk, cli.namespace.as_deref(), cli.sync_timeout, None).await?;
            let mut items = informer.cache().list();
            items.sort_by(|a, b| a.key().cmp(&b.key()));
            match cli.output {
                Output::Human => {
                    for o in &items {
                        println!("{}\t{}", o.key(), o.resource_version);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&items)?),
            }
            info!(items = items.len(), "ls done");
            informer.stop().await?;
        }
        Commands::Watch { gvk } => {
            let mut informer = synced_informer(
                &gvk,
                cli.namespace.as_deref(),
                cli.sync_timeout,
                Some(Arc::new(PrintHandler)),
            )
            .await?;
            info!(objects = informer.cache().len(), "synced; watching (ctrl-c to stop)");
            tokio::signal::ctrl_c().await?;
            informer.stop().await?;
        }
        Commands::Get { gvk, name } => {
            let mut informer =
                synced_informer(&gvk, cli.namespace.as_deref(), cli.sync_timeout, None).await?;
            let found = lookup(&informer.cache().list(), cli.namespace.as_deref(), &name);
            match found {
                Ok(obj) => println!("{}", serde_json::to_string_pretty(&obj.raw)?),
                Err(e) => {
                    informer.stop().await?;
                    return Err(e);
                }
            }
            informer.stop().await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(ns: Option<&str>, name: &str) -> Obj {
        Obj {
            namespace: ns.map(|s| s.to_string()),
            name: name.into(),
            resource_version: "1".into(),
            raw: serde_json::json!({ "metadata": { "name": name } }),
        }
    }

    #[test]
    fn lookup_without_namespace_finds_namespaced_object() {
        let items = vec![obj(Some("default"), "web"), obj(Some("default"), "api")];
        let got = lookup(&items, None, "web").unwrap();
        assert_eq!(got.namespace.as_deref(), Some("default"));
        assert_eq!(got.name, "web");
    }

    #[test]
    fn lookup_with_namespace_is_exact() {
        let items = vec![obj(Some("prod"), "web"), obj(Some("dev"), "web")];
        let got = lookup(&items, Some("dev"), "web").unwrap();
        assert_eq!(got.namespace.as_deref(), Some("dev"));
        assert!(lookup(&items, Some("staging"), "web").is_err());
    }

    #[test]
    fn lookup_ambiguous_name_requires_namespace() {
        let items = vec![obj(Some("prod"), "web"), obj(Some("dev"), "web")];
        let err = lookup(&items, None, "web").unwrap_err();
        assert!(err.to_string().contains("ambiguous"));
    }

    #[test]
    fn lookup_missing_name_errors() {
        let items = vec![obj(Some("default"), "web")];
        assert!(lookup(&items, None, "ghost").is_err());
    }
}
