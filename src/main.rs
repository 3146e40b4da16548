//! Thin CLI over the pipeline
//!
//! Parses the task, binds the environment into a config once, subscribes to
//! the event bus for progress lines, and runs the pipeline. Interrupts exit
//! with code 130 after the queue and checkpoint files are left resumable.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use somspider::config;
use somspider::pipeline::{self, PipelineEvent, PipelineEventBus, PipelineOptions};
use somspider::task::{DataType, FieldDefinition, Task};

#[derive(Parser, Debug)]
#[command(name = "somspider", version, about = "Vision-assisted web crawler")]
struct Cli {
    /// List page to start from
    #[arg(long, required_unless_present = "task_file")]
    list_url: Option<String>,

    /// Natural-language description of what to collect
    #[arg(long, required_unless_present = "task_file")]
    task: Option<String>,

    /// Field definition, repeatable: name:type[:required][:description]
    /// (type is text|number|date|url)
    #[arg(long = "field", value_parser = parse_field)]
    fields: Vec<FieldDefinition>,

    /// JSON task file as an alternative to --list-url/--task/--field
    #[arg(long, conflicts_with_all = ["list_url", "task", "fields"])]
    task_file: Option<PathBuf>,

    #[arg(long, default_value = "output")]
    output_dir: PathBuf,

    #[arg(long)]
    headless: Option<bool>,

    /// Detail pages visited during exploration
    #[arg(long)]
    explore_count: Option<usize>,

    /// Pages used to validate induced templates
    #[arg(long)]
    validate_count: Option<usize>,

    /// Maximum list pages to paginate through
    #[arg(long)]
    max_pages: Option<u32>,
}

fn parse_field(raw: &str) -> Result<FieldDefinition, String> {
    let mut parts = raw.splitn(4, ':');
    let name = parts
        .next()
        .filter(|n| !n.is_empty())
        .ok_or("field needs a name")?;
    let data_type = match parts.next().unwrap_or("text") {
        "text" => DataType::Text,
        "number" => DataType::Number,
        "date" => DataType::Date,
        "url" => DataType::Url,
        other => return Err(format!("unknown field type '{other}'")),
    };
    let required = matches!(parts.next(), Some("required") | Some("true"));
    let description = parts.next().unwrap_or(name).to_string();

    Ok(FieldDefinition {
        name: name.to_string(),
        description,
        required,
        data_type,
        example: None,
    })
}

async fn load_task(cli: &Cli) -> Result<Task> {
    if let Some(path) = &cli.task_file {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("cannot read task file {path:?}"))?;
        return serde_json::from_str(&raw).with_context(|| format!("bad task file {path:?}"));
    }
    Ok(Task {
        list_url: cli.list_url.clone().unwrap_or_default(),
        task_description: cli.task.clone().unwrap_or_default(),
        fields: cli.fields.clone(),
    })
}

fn print_event(event: &PipelineEvent) {
    match event {
        PipelineEvent::CollectStarted { list_url, .. } => {
            println!("collecting from {list_url}");
        }
        PipelineEvent::PageHarvested { page_num, new_urls, total_urls, .. } => {
            println!("page {page_num}: +{new_urls} URLs ({total_urls} total)");
        }
        PipelineEvent::PatternsReady { field_count, validated_count, .. } => {
            println!("templates ready: {validated_count}/{field_count} validated");
        }
        PipelineEvent::ExtractCompleted { url, success, .. } => {
            println!("{} {url}", if *success { "ok " } else { "fail" });
        }
        PipelineEvent::PipelineCompleted { total_urls, success_count, duration, .. } => {
            println!("done: {success_count}/{total_urls} extracted in {duration:.1?}");
        }
        PipelineEvent::Shutdown { .. } => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let task = load_task(&cli).await?;
    let config = config::from_env();

    let bus = PipelineEventBus::new(256);
    let mut receiver = bus.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = receiver.recv().await {
            let is_shutdown = matches!(event, PipelineEvent::Shutdown { .. });
            print_event(&event);
            if is_shutdown {
                break;
            }
        }
    });

    let llm = somspider::OpenAiCompatClient::new(config.llm.clone())
        .context("LLM credentials unavailable (set SOMSPIDER_API_KEY)")?;
    let mut run_config = config.clone();
    let options = PipelineOptions {
        output_dir: cli.output_dir.clone(),
        headless: cli.headless,
        explore_count: cli.explore_count,
        validate_count: cli.validate_count,
        max_pages: cli.max_pages,
    };
    if let Some(headless) = options.headless {
        run_config.browser.headless = headless;
    }
    if let Some(explore) = options.explore_count {
        run_config.collector.explore_count = explore;
        run_config.extractor.explore_count = explore;
    }
    if let Some(validate) = options.validate_count {
        run_config.extractor.validate_count = validate;
    }
    if let Some(max_pages) = options.max_pages {
        run_config.collector.max_pages = max_pages;
    }

    tokio::fs::create_dir_all(&options.output_dir)
        .await
        .with_context(|| format!("cannot create output dir {:?}", options.output_dir))?;

    let (browser, handler_task) =
        somspider::browser::cdp::launch_browser(&run_config.browser).await?;

    let summary = pipeline::run_pipeline_with(
        &browser,
        Some(&llm),
        &task,
        &run_config,
        &options.output_dir,
        Some(bus),
    )
    .await;

    handler_task.abort();
    let _ = handler_task.await;
    let _ = printer.await;

    let summary = summary?;
    println!(
        "collected {} URL(s); extracted {}/{} ({} dead-lettered)",
        summary.collected_urls, summary.success_count, summary.total_urls,
        summary.dead_letter_count
    );

    if summary.interrupted {
        std::process::exit(130);
    }
    Ok(())
}
