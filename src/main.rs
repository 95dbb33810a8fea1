use clap::Parser;
use qardioarm_listener::platform::bluer::BluerCentral;
use qardioarm_listener::{Options, WriterSink, logging, run_until};
use std::panic::{self, PanicHookInfo};
use std::sync::Arc;

/// Exit codes for the application
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_PANIC: i32 = 2;

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

async fn run(options: Options) -> Result<(), qardioarm_listener::RunError> {
    let central = BluerCentral::new(options.adapter.as_deref()).await?;
    let formatter = options
        .format
        .formatter(options.influxdb_measurement.clone());
    let sink = WriterSink::new(formatter, std::io::stdout());

    run_until(
        &options,
        Arc::new(central),
        Arc::new(sink),
        &mut std::io::stderr(),
        shutdown_signal(),
    )
    .await
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Set up panic hook to ensure clean exit codes for process managers
    // (e.g., systemd, Telegraf execd) that monitor exit status
    panic::set_hook(Box::new(move |info: &PanicHookInfo| {
        eprintln!("Panic! {}", info);
        std::process::exit(EXIT_PANIC);
    }));

    let options = Options::parse();
    logging::init_logging(options.verbose);

    match run(options).await {
        Ok(_) => std::process::exit(EXIT_SUCCESS),
        Err(why) => {
            eprintln!("error: {}", why);
            std::process::exit(EXIT_ERROR);
        }
    }
}
