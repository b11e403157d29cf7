use anyhow::Result;

use ampinvt_bridge::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    let options = Options::new();
    let config = Config::new(options.config_file.clone())?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.loglevel.as_str()),
    )
    .format(|buf, record| {
        writeln!(
            buf,
            "[{} {} {}] {}",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
            record.level(),
            record.module_path().unwrap_or(""),
            record.args()
        )
    })
    .write_style(env_logger::WriteStyle::Never)
    .init();

    info!("Read configuration from {}", options.config_file);
    config.log_summary();

    ampinvt_bridge::app(config).await
}
