use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

mod cli;
mod config;
mod flows;
mod model;
mod observe;
mod pipeline;
mod product;
mod schema;
mod store;
mod util;

use cli::{Command, InitConfigArgs, ProductArgs, ReviewArgs, RootArgs, RunArgs, ShowArgs};
use config::PipelineConfig;
use flows::{
    CategorizationFlow, DescriptionFlow, FlowContext, FlowError, FlowResult, ReviewContext,
    ReviewFlow,
};
use observe::{Fanout, InvocationObserver, JsonlRecorder, TracingObserver};
use store::{DirStore, ListingStore};

/// Env var holding the `tracing` filter directive.
const LOG_ENV: &str = "LISTING_ASSIST_LOG";

/// Exit code when a flow ran but produced no result.
const FLOW_FAILED_EXIT: u8 = 2;

fn main() -> ExitCode {
    init_tracing();
    let args = RootArgs::parse();
    match dispatch(args) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn dispatch(args: RootArgs) -> Result<ExitCode> {
    match &args.command {
        Command::InitConfig(init) => run_init_config(init),
        Command::Describe(product) => run_describe(&args, product),
        Command::Categorize(product) => run_categorize(&args, product),
        Command::Review(review) => run_review(&args, review),
        Command::Run(run) => run_pipeline(&args, run),
        Command::Show(show) => run_show(show),
        Command::Records(records) => {
            let loaded = observe::load_records(&records.path)?;
            print_json(&observe::summarize_records(&loaded))?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn run_init_config(args: &InitConfigArgs) -> Result<ExitCode> {
    let path = match &args.path {
        Some(path) => path.clone(),
        None => config::user_config_path()
            .ok_or_else(|| anyhow!("no user config directory; pass --path"))?,
    };
    config::write_config(&path, &config::config_stub()?, args.force)?;
    eprintln!("wrote {}", path.display());
    Ok(ExitCode::SUCCESS)
}

/// Shared setup for every command that talks to a model.
struct Session {
    config: PipelineConfig,
    backend: Arc<dyn model::ModelBackend>,
    observer: Arc<dyn InvocationObserver>,
}

impl Session {
    fn open(args: &RootArgs) -> Result<Self> {
        let config = config::load_effective_config(args.config.as_deref())?;
        let backend_config = config::resolve_backend_config(args.lm.as_deref(), &config)?;
        let backend = config::build_backend(&backend_config)?;
        let mut fanout = Fanout::new().with(Arc::new(TracingObserver));
        if let Some(path) = &args.records {
            fanout = fanout.with(Arc::new(JsonlRecorder::new(path)));
        }
        tracing::debug!(backend = backend.name(), "session ready");
        Ok(Self {
            config,
            backend,
            observer: Arc::new(fanout),
        })
    }

    fn context(&self) -> FlowContext {
        FlowContext::new(
            self.backend.clone(),
            self.observer.clone(),
            self.config.invocation.clone(),
            self.config.passthrough_fields.clone(),
        )
    }
}

fn run_describe(args: &RootArgs, product: &ProductArgs) -> Result<ExitCode> {
    let draft = product::load_draft(&product.product)?;
    let session = Session::open(args)?;
    let flow = DescriptionFlow::new(session.context(), &session.config.description);
    emit(flow.run(&draft))
}

fn run_categorize(args: &RootArgs, product: &ProductArgs) -> Result<ExitCode> {
    let draft = product::load_draft(&product.product)?;
    let session = Session::open(args)?;
    let flow = CategorizationFlow::new(session.context(), &session.config.categorization);
    emit(flow.run(&draft))
}

fn run_review(args: &RootArgs, review: &ReviewArgs) -> Result<ExitCode> {
    let draft = product::load_draft(&review.product)?;
    let context = ReviewContext {
        description: review.description.as_deref().map(read_flow_value).transpose()?,
        classification: review
            .classification
            .as_deref()
            .map(read_flow_value)
            .transpose()?,
    };
    let session = Session::open(args)?;
    let flow = ReviewFlow::new(session.context(), &session.config.review.policies);
    emit(flow.run(&draft, &context))
}

fn run_pipeline(args: &RootArgs, run: &RunArgs) -> Result<ExitCode> {
    let draft = product::load_draft(&run.product)?;
    let session = Session::open(args)?;
    let mut pipeline =
        pipeline::Pipeline::new(session.backend, session.observer, session.config);
    if let Some(dir) = &run.store {
        pipeline = pipeline.with_store(Arc::new(DirStore::new(dir)));
    }
    if let Some(ms) = run.deadline_ms {
        pipeline = pipeline.with_deadline(Duration::from_millis(ms));
    }
    let assessment = pipeline.assess(&run.id, &draft)?;
    print_json(&assessment)?;
    Ok(ExitCode::SUCCESS)
}

fn run_show(show: &ShowArgs) -> Result<ExitCode> {
    let store = DirStore::new(&show.store);
    let assessment = store
        .load(&show.id)?
        .ok_or_else(|| anyhow!("no assessment for {:?} in {}", show.id, show.store.display()))?;
    print_json(&assessment)?;
    Ok(ExitCode::SUCCESS)
}

/// Print a flow result, or the typed failure with a distinct exit code.
fn emit<T: Serialize>(result: Result<FlowResult<T>, FlowError>) -> Result<ExitCode> {
    match result {
        Ok(result) => {
            print_json(&result)?;
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            eprintln!("error: {err}");
            print_json(&err)?;
            Ok(ExitCode::from(FLOW_FAILED_EXIT))
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{text}");
    Ok(())
}

/// Read a flow value, accepting either the bare value or a full `describe`/`categorize` output.
fn read_flow_value<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let mut value: serde_json::Value =
        serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))?;
    if let Some(inner) = value
        .as_object_mut()
        .filter(|map| map.contains_key("repaired"))
        .and_then(|map| map.remove("value"))
    {
        value = inner;
    }
    serde_json::from_value(value).with_context(|| format!("decode {}", path.display()))
}
