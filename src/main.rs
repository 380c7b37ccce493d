use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use story_illustrator::core::catalog::StoryCatalog;
use story_illustrator::core::config::Config;
use story_illustrator::core::io::NativeStorage;
use story_illustrator::services::image::create_image_generator;
use story_illustrator::services::workflow::{BatchIllustrator, ItemStatus, SelectionPolicy};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = Config::load()?;
    config.ensure_directories()?;

    let catalog = match &config.catalog_file {
        Some(path) => StoryCatalog::load(Path::new(path))?,
        None => StoryCatalog::preset()?,
    };
    if catalog.is_empty() {
        log::warn!("Story catalog is empty, nothing to illustrate");
    }
    println!("{} stories, output folder: {}", catalog.len(), config.output_folder);

    // Unreachable service aborts the run before any work is done.
    println!("Connecting to {} ...", config.generator.gradio.base_url);
    let generator = create_image_generator(&config)
        .await
        .context("Failed to initialize image generator")?;

    let storage = Arc::new(NativeStorage::new());
    let selection = config.selection.clone();
    let driver = BatchIllustrator::new(config, catalog, generator, storage);
    let report = driver.run(&selection).await?;

    if selection == SelectionPolicy::Covers {
        for outcome in &report.outcomes {
            let icon = match outcome.status {
                ItemStatus::Failed(_) => "x",
                _ => "v",
            };
            println!("  [{}] {}", icon, outcome.target);
        }
    }

    println!(
        "Done: {} images, {} succeeded ({} already present), {} failed",
        report.total,
        report.succeeded,
        report.skipped,
        report.failed()
    );
    println!("{}", report.summary());
    Ok(())
}
