use anyhow::Result;
use clap::{Arg, ArgAction, Command};
use task_processor::common::{start_application, StartupConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("task-processor")
        .version("1.0.0")
        .about("基于数据库行锁的持久化任务处理器")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，默认查找 config/task_processor.toml"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式")
                .value_parser(["json", "pretty"]),
        )
        .arg(
            Arg::new("run-by-processor")
                .long("run-by-processor")
                .help("以处理器角色运行：注册周期任务并启动处理循环")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let startup_config = StartupConfig {
        config_path: matches.get_one::<String>("config").cloned(),
        log_level: matches.get_one::<String>("log-level").cloned(),
        log_format: matches.get_one::<String>("log-format").cloned(),
        run_by_processor: matches.get_flag("run-by-processor"),
    };

    start_application(startup_config).await
}
