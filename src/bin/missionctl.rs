//! missionctl - operate on missions and the model registry directly in the database.

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};

use ahon_pipeline::Store;

#[derive(Parser, Debug)]
#[command(name = "missionctl", about = "Manage missions and detection models")]
struct Args {
    /// Path to the pipeline SQLite DB
    #[arg(long, env = "AHON_DB_PATH", default_value = "ahon.db")]
    db: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open a new mission
    Start,
    /// Close a mission
    End {
        #[arg(long)]
        id: i64,
    },
    /// List missions
    Missions,
    /// List the model catalog
    Models,
    /// Select a model and set the shared confidence threshold
    Select {
        #[arg(long)]
        id: i64,
        #[arg(long)]
        confidence: f32,
    },
    /// Register a model type in the catalog
    AddModel {
        #[arg(long = "type", value_name = "LABEL")]
        model_type: String,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    let store = Store::open(&args.db, 0.5)?;

    match args.command {
        Command::Start => {
            let mission = store.create_mission(Utc::now())?;
            println!("mission {} started at {}", mission.id, mission.started_at);
        }
        Command::End { id } => {
            let mission = store.close_mission(id, Utc::now())?;
            if let Some(ended_at) = mission.ended_at {
                println!("mission {} ended at {}", mission.id, ended_at);
            }
        }
        Command::Missions => {
            for mission in store.list_missions()? {
                let state = match mission.ended_at {
                    Some(ended_at) => format!("closed {}", ended_at),
                    None => "open".to_string(),
                };
                println!("{:>4}  started {}  {}", mission.id, mission.started_at, state);
            }
        }
        Command::Models => {
            for model in store.list_models()? {
                println!(
                    "{:>4}  {:<16} confidence={:.2}{}",
                    model.id,
                    model.model_type,
                    model.confidence,
                    if model.is_selected { "  [selected]" } else { "" }
                );
            }
        }
        Command::Select { id, confidence } => {
            let model = store.select_model_with_confidence(id, confidence)?;
            println!(
                "selected model {} ({}) at confidence {:.2}",
                model.id, model.model_type, model.confidence
            );
        }
        Command::AddModel { model_type } => {
            let model = store.upsert_model(&model_type)?;
            println!("model {} = {}", model.id, model.model_type);
        }
    }
    Ok(())
}
