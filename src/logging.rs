//! 日志系统模块，提供统一的日志初始化

use std::sync::Once;

use time::format_description::well_known::Rfc3339;
use tracing::Level;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// 确保日志系统只初始化一次
static INIT: Once = Once::new();

/// Parse a level name such as `info` or `DEBUG`.
pub fn parse_level(name: &str) -> Option<Level> {
    name.trim().parse::<Level>().ok()
}

/// 日志系统初始化函数
///
/// # 参数
/// * `default_level` - 默认日志级别
/// * `app_name` - 应用名称, 用于环境变量前缀
///
/// `<APP>_LOG` overrides the filter, `<APP>_JSON` switches to JSON output.
///
/// # 示例
/// ```
/// use mole::setup_logging;
///
/// // 默认使用 INFO 级别，可通过 MOLE_LOG 环境变量覆盖
/// setup_logging(tracing::Level::INFO, "MOLE");
/// ```
pub fn setup_logging(default_level: Level, app_name: &str) {
    INIT.call_once(|| {
        let env_name = format!("{}_LOG", app_name);
        let directive = default_level.as_str().to_lowercase();

        // mole=debug 意味着我们的代码使用指定级别，russh 等依赖库默认只输出警告
        let filter = EnvFilter::try_from_env(&env_name)
            .unwrap_or_else(|_| EnvFilter::new(format!("warn,mole={}", directive)));

        // russh 通过 log crate 输出，需要先桥接到 tracing
        tracing_log::LogTracer::init().ok();

        if std::env::var(format!("{}_JSON", app_name)).is_ok() {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_timer(UtcTime::new(Rfc3339)))
                .try_init()
                .ok(); // 测试中可能已经初始化
        } else {
            let fmt_layer = fmt::layer()
                .with_timer(UtcTime::new(Rfc3339))
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true);
            tracing_subscriber::registry().with(filter).with(fmt_layer).try_init().ok();
        }

        tracing::info!("日志系统初始化完成 [{} {}]", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    });
}
