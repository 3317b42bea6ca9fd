mod extension;
mod input;

use camino::Utf8PathBuf;
use clap::Parser;
use muster_scheduler::{Scheduler, UnitKey};
use tracing::{error, info, info_span, metadata::LevelFilter};
use tracing_subscriber::{prelude::*, EnvFilter};

use crate::{
    extension::{module_pipeline, ModuleAst, ModuleExtension},
    input::{list_module_files, read_module_file, Input},
};

#[derive(Debug, Parser)]
pub struct Args {
    /// Directory containing the modules to compile.
    ///
    /// The directory is walked recursively to find `.mod` files; each file is one module named
    /// after its file stem.
    directory: Utf8PathBuf,

    /// External module directories, searched when a compiled module depends on one that is not
    /// part of the main directory.
    #[clap(short = 's', long)]
    source: Vec<Utf8PathBuf>,

    /// Print the per-module outcome table after compiling.
    #[clap(long)]
    dump_reports: bool,
}

pub fn fallible_main(args: Args) -> anyhow::Result<bool> {
    let _span = info_span!("muster").entered();

    let main_modules = {
        let _span = info_span!("list_main_modules").entered();
        let modules = list_module_files(&args.directory)?;
        info!(module_count = modules.len());
        modules
    };

    let input = {
        let _span = info_span!("list_external_modules").entered();
        let mut input = Input::new();
        let mut module_count = 0;
        for dir in &args.source {
            module_count += input.add_search_dir(dir)?;
        }
        info!(module_count);
        input
    };

    let mut scheduler = Scheduler::new();
    scheduler.register_pipeline("module", module_pipeline())?;
    {
        let _span = info_span!("load_main_modules").entered();
        for path in &main_modules {
            let Some(stem) = path.file_stem() else {
                continue;
            };
            let text = read_module_file(path)?;
            scheduler.add_unit(UnitKey::new(stem), "module", ModuleAst::Source { text })?;
        }
    }

    let mut ext = ModuleExtension::new(input);
    let success = {
        let _span = info_span!("compile").entered();
        scheduler.run_to_completion(&mut ext)?
    };

    for diagnostic in &scheduler.diagnostics {
        eprintln!("{diagnostic}");
    }

    if args.dump_reports {
        for report in scheduler.unit_reports() {
            println!(
                "{}: {} (got to {})",
                report.key,
                if report.success { "ok" } else { "failed" },
                report.furthest_pass.as_deref().unwrap_or("nothing"),
            );
        }
    }

    if !success {
        error!("compilation failed");
    }
    Ok(success)
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::registry().with(
        tracing_subscriber::fmt::layer()
            .without_time()
            .with_writer(std::io::stderr)
            .with_filter(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::WARN.into())
                    .from_env_lossy(),
            ),
    );
    tracing::subscriber::set_global_default(subscriber)
        .expect("cannot set default tracing subscriber");

    match fallible_main(args) {
        Ok(true) => (),
        Ok(false) => std::process::exit(1),
        Err(error) => {
            error!("{error:?}");
            std::process::exit(1);
        }
    }
}
