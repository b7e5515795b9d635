use anyhow::{Context, Result};
use clap::Parser;
use reqwest::Url;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use inbox_relay::classifier::{Classifier, LlmClassifier};
use inbox_relay::gmail::{GmailClient, MailProvider};
use inbox_relay::identity::{IdentityClient, IdentityProvider};
use inbox_relay::model::Interval;
use inbox_relay::server::{self, AppState};
use inbox_relay::sms::{SmsSender, TwilioClient};
use inbox_relay::{config, db, queue, tasks, watch};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/relay.db", cfg.app.data_dir));

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let mail: Arc<dyn MailProvider> = Arc::new(GmailClient::new(cfg.gmail.pubsub_topic.clone()));
    let classifier: Arc<dyn Classifier> = Arc::new(LlmClassifier::new(
        cfg.classifier.api_key.clone(),
        cfg.classifier.model.clone(),
    ));
    let sender: Arc<dyn SmsSender> = Arc::new(TwilioClient::new(
        cfg.sms.account_sid.clone(),
        cfg.sms.auth_token.clone(),
        cfg.sms.from_number.clone(),
    ));
    let identity_url =
        Url::parse(&cfg.identity.base_url).context("invalid identity.base_url")?;
    let identity: Arc<dyn IdentityProvider> = Arc::new(IdentityClient::new(
        identity_url,
        cfg.identity.secret_key.clone(),
    ));

    // Task worker (single-threaded): runs deferred fetch/refresh continuations.
    {
        let pool = pool.clone();
        let mail = mail.clone();
        let classifier = classifier.clone();
        let sender = sender.clone();
        let identity = identity.clone();
        let country_code = cfg.sms.country_code.clone();
        let poll_sleep = Duration::from_millis(cfg.app.task_poll_interval_ms);
        tokio::spawn(async move {
            loop {
                match tasks::process_next_task(
                    &pool,
                    mail.as_ref(),
                    classifier.as_ref(),
                    sender.as_ref(),
                    identity.as_ref(),
                    &country_code,
                )
                .await
                {
                    Ok(processed) => {
                        if !processed {
                            tokio::time::sleep(poll_sleep).await;
                        }
                    }
                    Err(err) => {
                        error!(?err, "task worker error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });
    }

    // Subscription refresh: Gmail watches expire after ~7 days, renew well
    // before that.
    {
        let pool = pool.clone();
        let every = Duration::from_secs(cfg.app.refresh_interval_hours * 3600);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                if let Err(err) = watch::refresh_all(&pool).await {
                    error!(?err, "watch refresh failed");
                }
            }
        });
    }

    // One drain loop per interval bucket.
    for (interval, secs) in [
        (Interval::EveryHour, 3600),
        (Interval::Every2Hours, 7200),
    ] {
        let pool = pool.clone();
        let sender = sender.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(secs));
            // The first tick fires immediately; skip it so a fresh boot does
            // not drain a half-filled bucket early.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = queue::drain(&pool, sender.as_ref(), interval).await {
                    error!(?err, interval = interval.as_str(), "queue drain failed");
                }
            }
        });
    }

    let state = AppState {
        pool,
        mail,
        classifier,
        sender,
        identity,
        task_delay: chrono::Duration::milliseconds(cfg.app.task_delay_ms as i64),
    };
    let router = server::build_router(state);

    info!(addr = %cfg.app.bind_addr, "starting relay server");
    let listener = tokio::net::TcpListener::bind(&cfg.app.bind_addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
