//! The main entrypoint for grubenhancer, a tool to boot ISO images from GRUB.

use anyhow::Result;

async fn run() -> Result<()> {
    grubenhancer_utils::initialize_tracing();
    tracing::trace!("starting {}", env!("CARGO_PKG_NAME"));
    grubenhancer_lib::cli::run_from_iter(std::env::args_os()).await
}

fn main() {
    grubenhancer_utils::run_main(|| {
        // Nothing here needs more than one thread; blocking work such as
        // scanning goes to the blocking pool.
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(run())
    })
}
