use core::{error::Error, sync::atomic::Ordering};

use clap::Parser;
use rush::{cfg::Config, cmd::Cmd, report::Report, runtime::Runtime};
use tokio::runtime::Builder;

#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

pub fn main() {
    let cmd = Cmd::parse();
    rush::logging::init(cmd.verbose as usize).unwrap();

    match run(cmd) {
        Ok(report) => {
            print!("{report}");
            if !report.passed() {
                std::process::exit(1);
            }
        }
        Err(err) => {
            eprintln!("ERROR: {err}");
            std::process::exit(1);
        }
    }
}

fn run(cmd: Cmd) -> Result<Report, Box<dyn Error>> {
    let report_json = cmd.report_json.clone();
    let cfg: Config = cmd.try_into()?;

    // Init I/O runtime.
    let report = Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .thread_name("runtime")
        .build()?
        .block_on(async {
            let runtime = Runtime::new(cfg);

            let cancel = runtime.cancel_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    log::warn!("interrupted, draining");
                    cancel.store(false, Ordering::SeqCst);
                }
            });

            runtime.run().await
        });

    if let Some(path) = &report_json {
        report.write_json(path)?;
    }

    Ok(report)
}
