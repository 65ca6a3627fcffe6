#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

mod core;
mod datasets;
mod models;
use clap::Parser;

fn main() -> anyhow::Result<()> {
    let lnr = core::Learner::parse();
    let _log_handle = log4rs::init_config(core::build_log_config(&lnr)?)?;
    log::info!("{:?}", lnr);

    let history = core::run(&lnr)?;
    if let Some(i) = history.len().checked_sub(1) {
        log::info!(
            "Finished {} epochs -> final train loss: {:.4}, train acc: {:5.2}%, val loss: {:.4}, val acc: {:5.2}%",
            history.len(),
            history.train_loss[i],
            history.train_acc[i],
            history.val_loss[i],
            history.val_acc[i]
        );
    }
    Ok(())
}
