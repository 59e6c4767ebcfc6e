//! ログ出力の初期化

use tracing_subscriber::EnvFilter;

/// `RUST_LOG` 未設定時のフィルタ
pub const DEFAULT_FILTER: &str = "photo_selector_lib=info";

/// tracing サブスクライバを登録する
///
/// ホストアプリから複数回呼ばれても問題ない（2回目以降は何もしない）。
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_is_idempotent() {
        init_tracing();
        init_tracing();
        tracing::info!("tracing initialized twice");
    }
}
