// co3 CLI - inspect and maintain co3-managed SQLite databases

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::io::Write;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use co3::{
    DatabaseConfig, Filter, Manager, OrderBy, QueryResult, RelationalAccessor, SearchOptions,
    SelectOptions, SqlDatabase, SqlRelation, SqlSchema, Value, FTS_TOKENIZERS,
};

#[derive(Parser)]
#[clap(version, about = "COllate, COllect, COmpose: SQLite schema and query utility")]
#[clap(propagate_version = true)]
struct Cli {
    /// Database path (overrides CO3_DB_PATH)
    #[clap(long, global = true)]
    db: Option<PathBuf>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Schema definition commands
    #[clap(subcommand)]
    Schema(SchemaCommand),
    /// List tables and their columns
    Tables,
    /// Select rows from a table
    Select {
        table: String,
        /// Comma separated columns
        #[clap(long, value_delimiter = ',')]
        cols: Option<Vec<String>>,
        /// `column=value` equality filters (values parsed as JSON when possible)
        #[clap(long = "where")]
        filters: Vec<String>,
        /// `column [asc|desc]`
        #[clap(long)]
        order_by: Option<String>,
        #[clap(long, default_value_t = 0)]
        limit: usize,
        #[clap(long, value_enum, default_value_t = Format::Table)]
        format: Format,
    },
    /// Full-text search over an FTS index
    Search {
        /// Index name (without the `_fts_<tokenizer>` suffix)
        name: String,
        q: String,
        /// Space separated columns to restrict the query to
        #[clap(long)]
        search_cols: Option<String>,
        #[clap(long, default_value = "unicode61")]
        tokenizer: String,
        #[clap(long, default_value_t = 100)]
        limit: usize,
        #[clap(long)]
        group_by: Option<String>,
        #[clap(long, value_enum, default_value_t = Format::Table)]
        format: Format,
    },
    /// Build FTS indexes from a table
    FtsIndex {
        /// Index name
        name: String,
        /// Source table
        table: String,
        #[clap(long, value_delimiter = ',')]
        cols: Option<Vec<String>>,
        #[clap(long, value_delimiter = ',')]
        tokenizers: Option<Vec<String>>,
    },
    /// Migrate the database to a schema, keeping rows that still fit
    Migrate { schema: PathBuf },
}

#[derive(Subcommand)]
enum SchemaCommand {
    /// Drop and create every table of a schema definition
    Apply { path: PathBuf },
    /// Print the DDL for a schema definition
    Show { path: PathBuf },
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Table,
    Json,
    Csv,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = DatabaseConfig::from_env();
    if let Some(path) = cli.db {
        config.path = path;
    }

    match cli.command {
        Commands::Schema(SchemaCommand::Show { path }) => {
            let schema = load_schema(&path)?;
            for sql in schema.create_statements()? {
                println!("{};\n", sql);
            }
        }
        Commands::Schema(SchemaCommand::Apply { path }) => {
            let schema = load_schema(&path)?;
            let mut db = open(config)?;
            db.recreate(&schema)
                .with_context(|| format!("Failed to apply schema \"{}\"", schema.name()))?;
            println!("✓ Applied schema \"{}\" ({} tables)", schema.name(), schema.len());
        }
        Commands::Tables => {
            let db = open(config)?;
            for table in db.access().table_names()? {
                let columns = db.access().table_columns(&table)?;
                println!("{} ({})", table, columns.join(", "));
            }
        }
        Commands::Select {
            table,
            cols,
            filters,
            order_by,
            limit,
            format,
        } => {
            let db = open(config)?;
            let relation = resolve_relation(&db, &table)?;

            let mut opts = SelectOptions::new().limit(limit).include_cols();
            opts.cols = cols;
            for filter in &filters {
                opts.filter = Some(match opts.filter.take() {
                    None => parse_filter(filter)?,
                    Some(existing) => existing.and(parse_filter(filter)?),
                });
            }
            if let Some(order) = order_by {
                opts = opts.order_by(OrderBy::parse(&order)?);
            }

            let result = db.access().select(&relation, &opts)?;
            print_result(&result, format)?;
        }
        Commands::Search {
            name,
            q,
            search_cols,
            tokenizer,
            limit,
            group_by,
            format,
        } => {
            let db = open(config)?;
            let opts = SearchOptions {
                q: Some(q),
                search_cols,
                tokenizer,
                limit,
                group_by,
                ..SearchOptions::new(name)
            };
            let results = db.fts().search(&opts).context("Search failed")?;

            match (&results.groups, format) {
                (Some(groups), _) => println!("{}", serde_json::to_string_pretty(groups)?),
                (None, format) => print_result(
                    &QueryResult {
                        columns: results.columns,
                        rows: results.rows,
                    },
                    format,
                )?,
            }
        }
        Commands::FtsIndex {
            name,
            table,
            cols,
            tokenizers,
        } => {
            let mut db = open(config)?;
            let relation = resolve_relation(&db, &table)?;
            let opts = SelectOptions {
                cols,
                ..SelectOptions::new()
            };
            let tokenizers: Vec<String> = tokenizers
                .unwrap_or_else(|| FTS_TOKENIZERS.iter().map(|t| t.to_string()).collect());
            let tokenizers: Vec<&str> = tokenizers.iter().map(String::as_str).collect();

            let indexed = db.manage_fts().recreate(&name, &relation, &opts, &tokenizers)?;
            println!("✓ Indexed {} rows into \"{}\" ({})", indexed, name, tokenizers.join(", "));
        }
        Commands::Migrate { schema } => {
            let schema = load_schema(&schema)?;
            let mut db = open(config)?;
            let report = db.manage().migrate(&schema)?;
            for (table, rows) in &report.tables {
                println!("  {:<30} {} rows", table, rows);
            }
            println!("✓ Migrated {} rows into schema \"{}\"", report.total(), schema.name());
        }
    }

    Ok(())
}

fn open(config: DatabaseConfig) -> Result<SqlDatabase> {
    let path = config.path.clone();
    info!("Opening {}", path.display());
    SqlDatabase::open(config).with_context(|| format!("Failed to open database {}", path.display()))
}

fn load_schema(path: &PathBuf) -> Result<SqlSchema> {
    SqlSchema::load(path).with_context(|| format!("Failed to load schema definition {}", path.display()))
}

fn resolve_relation(db: &SqlDatabase, table: &str) -> Result<SqlRelation> {
    db.relation(table)
        .with_context(|| format!("Cannot read table \"{}\"", table))
}

fn parse_filter(expr: &str) -> Result<Filter> {
    let (column, raw) = expr
        .split_once('=')
        .with_context(|| format!("Expected column=value, got {:?}", expr))?;
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok(Filter::eq(column.trim(), value))
}

fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn print_result(result: &QueryResult, format: Format) -> Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&result.rows)?),
        Format::Csv => {
            let mut writer = csv::Writer::from_writer(std::io::stdout());
            writer.write_record(&result.columns)?;
            for row in &result.rows {
                writer.write_record(result.columns.iter().map(|c| cell(row.get(c))))?;
            }
            writer.flush()?;
        }
        Format::Table => {
            let widths: Vec<usize> = result
                .columns
                .iter()
                .map(|c| {
                    result
                        .rows
                        .iter()
                        .map(|r| cell(r.get(c)).chars().count())
                        .chain(std::iter::once(c.chars().count()))
                        .max()
                        .unwrap_or(0)
                })
                .collect();

            let mut out = std::io::stdout().lock();
            let header: Vec<String> = result
                .columns
                .iter()
                .zip(&widths)
                .map(|(c, w)| format!("{:<w$}", c, w = w))
                .collect();
            writeln!(out, "{}", header.join("  "))?;
            writeln!(out, "{}", "━".repeat(header.join("  ").chars().count()))?;
            for row in &result.rows {
                let line: Vec<String> = result
                    .columns
                    .iter()
                    .zip(&widths)
                    .map(|(c, w)| format!("{:<w$}", cell(row.get(c)), w = w))
                    .collect();
                writeln!(out, "{}", line.join("  "))?;
            }
            writeln!(out, "({} rows)", result.len())?;
        }
    }
    Ok(())
}
