use std::path::PathBuf;

use cartsync_core::EntityKind;
use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "cartsync")]
#[command(about = "Keep a shopping list in step across devices")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Optional path to a JSON settings file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Add an entry to the local store
    #[command(subcommand)]
    Add(AddCommand),
    /// List the local shopping list
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove an entry from the local store
    #[command(alias = "rm")]
    Remove {
        /// Kind of entry
        #[arg(value_enum)]
        kind: KindArg,
        /// Local id
        id: i64,
    },
    /// Run two simulated devices against one in-memory remote list
    Demo,
}

#[derive(Subcommand)]
pub enum AddCommand {
    /// Add a category
    Category {
        name: String,
        /// ARGB color
        #[arg(long)]
        color: Option<i64>,
    },
    /// Add a product
    Product {
        name: String,
        /// Category name
        #[arg(long)]
        category: Option<String>,
    },
    /// Put a product on the list, creating the product when needed
    Item {
        /// Product name
        product: String,
        #[arg(short, long)]
        quantity: Option<String>,
        #[arg(short, long)]
        comment: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum KindArg {
    Category,
    Product,
    Item,
}

impl From<KindArg> for EntityKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Category => Self::Category,
            KindArg::Product => Self::Product,
            KindArg::Item => Self::ShopItem,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_add_item_with_options() {
        let cli = Cli::try_parse_from([
            "cartsync", "add", "item", "Milk", "-q", "2", "--db-path", "/tmp/x.db",
        ])
        .unwrap();
        assert_eq!(cli.db_path, Some(PathBuf::from("/tmp/x.db")));
        match cli.command {
            Some(Commands::Add(AddCommand::Item {
                product,
                quantity,
                comment,
            })) => {
                assert_eq!(product, "Milk");
                assert_eq!(quantity.as_deref(), Some("2"));
                assert!(comment.is_none());
            }
            _ => panic!("expected add item"),
        }
    }

    #[test]
    fn parses_remove_kind() {
        let cli = Cli::try_parse_from(["cartsync", "rm", "item", "7"]).unwrap();
        match cli.command {
            Some(Commands::Remove { kind, id }) => {
                assert_eq!(EntityKind::from(kind), EntityKind::ShopItem);
                assert_eq!(id, 7);
            }
            _ => panic!("expected remove"),
        }
    }

    #[test]
    fn rejects_unknown_kind() {
        assert!(Cli::try_parse_from(["cartsync", "remove", "aisle", "1"]).is_err());
    }
}
