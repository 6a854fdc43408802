use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use idxd_catalog::models::FlagStore;
use idxd_catalog::{
    CatalogBuilder, DeliveryContext, DirectorySource, LoopContext, MediaCatalog, RecordEvent,
    SortOrder, ViewChange, ViewSpec,
};

const TOP_ITEMS: usize = 20;
const DEFAULT_WATCH_SECS: u64 = 30;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("idxd_catalog=info".parse()?),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let Some(root) = args.next().map(PathBuf::from) else {
        bail!("usage: idxd-catalog <directory> [seconds]");
    };
    let watch_secs = match args.next() {
        Some(secs) => secs.parse().context("seconds must be a number")?,
        None => DEFAULT_WATCH_SECS,
    };
    if !root.is_dir() {
        bail!("{} is not a directory", root.display());
    }

    let mut builder = CatalogBuilder::new();
    match FlagStore::open_default() {
        Ok(store) => builder = builder.flag_store(Arc::new(store)),
        Err(e) => warn!(error = ?e, "Running without a flag store"),
    }
    let catalog = builder.build(Arc::new(DirectorySource::new(&root)));

    let main_loop = Arc::new(LoopContext::new());
    let context: Arc<dyn DeliveryContext> = main_loop.clone();

    let newest = catalog.create_view(ViewSpec::new(SortOrder::TakenDesc).capacity(TOP_ITEMS));
    let activation = catalog.activate();
    if !catalog.flush(Duration::from_secs(60)) {
        warn!("Initial scan is still running");
    }

    print_summary(&catalog, &newest.snapshot());

    let _records = catalog.subscribe_records(
        |event| match event {
            RecordEvent::Created(record) => println!("+ {}", record.path().display()),
            RecordEvent::Updated(record) => println!("~ {}", record.path().display()),
            RecordEvent::Deleted { id, record } => match record {
                Some(record) => println!("- {}", record.path().display()),
                None => println!("- #{}", id),
            },
        },
        Some(Arc::clone(&context)),
    );
    let view = newest.clone();
    let _changes = newest.subscribe(
        move |change| {
            let (verb, start, count) = match *change {
                ViewChange::Added { start, count } => ("added", start, count),
                ViewChange::Removed { start, count } => ("removed", start, count),
            };
            println!("newest: {} {}..{} ({} shown)", verb, start, start + count, view.len());
        },
        Some(context),
    );

    info!(seconds = watch_secs, "Watching for changes");
    main_loop.pump_for(Duration::from_secs(watch_secs));

    activation.close();
    Ok(())
}

fn print_summary(catalog: &MediaCatalog, newest: &[Arc<idxd_catalog::MediaRecord>]) {
    println!("Containers:");
    for container in catalog.containers() {
        println!(
            "  {:<32} {:>6}  {:?}",
            container.name,
            catalog.container_count(container.id),
            container.kind
        );
    }

    println!("Newest {} items:", newest.len());
    for record in newest {
        let (width, height) = record.dimensions();
        println!(
            "  {:>12}  {:>5}x{:<5}  {}",
            record.taken_at(),
            width,
            height,
            record.path().display()
        );
    }

    let stats = catalog.stats();
    info!(
        items = stats.table.loaded + stats.table.placeholders,
        containers = stats.containers,
        "Catalog ready"
    );
}
