//! ログ出力の初期化
//!
//! `tracing` のサブスクライバを設定します。ライブラリ側は `info!` などを呼ぶだけで、
//! 初期化はバイナリ側で一度だけ行います。

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// ログ設定
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: LogLevel,
    /// モジュールパスを表示するか
    pub include_target: bool,
    pub include_thread_ids: bool,
    pub ansi_colors: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            include_target: false,
            include_thread_ids: false,
            ansi_colors: true,
        }
    }
}

impl LogConfig {
    /// デバッグ用（バッチごとの損失も表示）
    pub fn verbose() -> Self {
        Self {
            level: LogLevel::Debug,
            include_target: true,
            include_thread_ids: true,
            ansi_colors: true,
        }
    }

    /// エラーのみ
    pub fn quiet() -> Self {
        Self {
            level: LogLevel::Error,
            ..Self::default()
        }
    }

    /// コマンドラインの指定から設定を選ぶ（明示したレベルが最優先）
    pub fn from_flags(verbose: bool, quiet: bool, level: Option<LogLevel>) -> Self {
        let mut config = if verbose {
            Self::verbose()
        } else if quiet {
            Self::quiet()
        } else {
            Self::default()
        };
        if let Some(level) = level {
            config.level = level;
        }
        config
    }
}

/// ログレベル
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

/// 指定した設定でログ出力を初期化
pub fn init_logging(config: &LogConfig) -> Result<(), String> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(config.level.to_tracing_level())
        .with_ansi(config.ansi_colors)
        .with_target(config.include_target)
        .with_thread_ids(config.include_thread_ids)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| format!("Failed to initialize logging: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_from_str() {
        assert_eq!("debug".parse::<LogLevel>(), Ok(LogLevel::Debug));
        assert_eq!("INFO".parse::<LogLevel>(), Ok(LogLevel::Info));
        assert_eq!("Warning".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_presets() {
        assert_eq!(LogConfig::default().level, LogLevel::Info);
        assert_eq!(LogConfig::verbose().level, LogLevel::Debug);
        assert_eq!(LogConfig::quiet().level, LogLevel::Error);
        assert_eq!(LogLevel::Warn.to_tracing_level(), Level::WARN);
    }

    #[test]
    fn test_from_flags() {
        assert_eq!(LogConfig::from_flags(false, false, None).level, LogLevel::Info);
        assert_eq!(LogConfig::from_flags(true, false, None).level, LogLevel::Debug);
        assert_eq!(LogConfig::from_flags(false, true, None).level, LogLevel::Error);

        let explicit = LogConfig::from_flags(true, false, Some(LogLevel::Warn));
        assert_eq!(explicit.level, LogLevel::Warn);
        assert!(explicit.include_target);
    }
}
