use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use rillview::{Filter, QueryBuilder, SortSpec, Store};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rillview", version, about = "Rillview CLI")]
struct Cli {
    /// Postgres connection string. Falls back to DATABASE_URL.
    #[arg(long)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the query text and bindings for a filter and sort
    Render(RenderArgs),

    /// Create the table backing an entity if it does not exist
    CreateTable {
        #[arg(long)]
        entity: String,
    },
}

#[derive(Args, Debug)]
struct RenderArgs {
    #[arg(long)]
    entity: String,

    #[arg(long, default_value = "obj")]
    alias: String,

    /// Identifier field, appended as the final sort key
    #[arg(long, default_value = "id")]
    id_field: String,

    /// Select expression (default: the aliased identifier)
    #[arg(long)]
    select: Option<String>,

    /// Render a count query instead of an identifier query
    #[arg(long, conflicts_with = "select")]
    count: bool,

    /// Filter as JSON, e.g. {"compare":{"field":"age","op":"greater","value":18}}
    #[arg(long, conflicts_with = "filter_file")]
    filter: Option<String>,

    /// Read the JSON filter from a file
    #[arg(long)]
    filter_file: Option<PathBuf>,

    /// Sort keys, e.g. group:asc,name:desc
    #[arg(long)]
    sort: Option<SortSpec>,

    /// Flip every sort direction
    #[arg(long)]
    reverse: bool,

    /// Rewrite named parameters as $1, $2, ...
    #[arg(long)]
    positional: bool,
}

#[tokio::main]
async fn main() -> rillview::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("rillview=info,warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Render(args) => render(args)?,
        Commands::CreateTable { entity } => {
            let url = match cli
                .database_url
                .or_else(|| std::env::var("DATABASE_URL").ok())
            {
                Some(u) => u,
                None => {
                    eprintln!("error: --database-url or env DATABASE_URL is required");
                    std::process::exit(2);
                }
            };
            let store = Store::connect(&url).await?;
            store.ensure_table_named(&entity).await?;
            println!("Table `{entity}` is ready.");
        }
    }

    Ok(())
}

fn render(args: RenderArgs) -> rillview::Result<()> {
    let filter: Option<Filter> = match (&args.filter, &args.filter_file) {
        (Some(text), _) => Some(serde_json::from_str(text)?),
        (None, Some(path)) => Some(serde_json::from_str(&std::fs::read_to_string(path)?)?),
        (None, None) => None,
    };

    let select = if args.count {
        format!("count({})", args.alias)
    } else {
        args.select
            .clone()
            .unwrap_or_else(|| format!("{}.{}", args.alias, args.id_field))
    };
    let sort = if args.count {
        None
    } else {
        Some(args.sort.unwrap_or_default().with_identifier(&args.id_field))
    };

    let rendered = QueryBuilder::new(&args.entity, &args.alias).build(
        &select,
        filter.as_ref(),
        sort.as_ref(),
        args.reverse,
        None,
    )?;

    if args.positional {
        let (sql, values) = rendered.to_positional()?;
        println!("{sql}");
        for (i, value) in values.iter().enumerate() {
            println!("  ${} = {}", i + 1, value);
        }
    } else {
        println!("{}", rendered.text());
        for binding in rendered.bindings() {
            println!("  :{} = {}", binding.name, binding.value);
        }
    }
    Ok(())
}
