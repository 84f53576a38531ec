use anyhow::{Error, Result};
use once_cell::sync::OnceCell;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Tracing サブスクライバを一度だけ初期化する。
///
/// `RUST_LOG` が設定されていない場合は `info` レベルにフォールバックします。
/// 構造化ログは stderr に出力し、stdout は各コマンドのサマリ表示に残します。
///
/// # Errors
/// サブスクライバの初期化に失敗した場合はエラーを返す。
pub fn init() -> Result<()> {
    TRACING_INIT.get_or_try_init(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .json();

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|e: tracing_subscriber::util::TryInitError| Error::msg(e.to_string()))?;
        info!("tracing initialized");

        Ok::<(), Error>(())
    })?;
    Ok(())
}
