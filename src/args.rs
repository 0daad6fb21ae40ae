use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use cloudfiles::api::{DownloadFormat, SharePermission, SortOrder};

#[derive(Parser, Debug)]
#[command(name = "cloudfiles")]
#[command(about = "Manage files in cloud storage from the command line", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Queue mutations locally instead of calling the API
    #[arg(long, global = true)]
    pub offline: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List files
    #[command(alias = "ls")]
    List {
        #[arg(short, long, default_value_t = 1)]
        page: u32,

        #[arg(long, default_value_t = 20)]
        page_size: u32,

        /// Search term
        #[arg(short, long)]
        search: Option<String>,

        /// Filter by file type
        #[arg(short = 't', long = "type")]
        file_type: Option<String>,

        /// Only files in this folder
        #[arg(long)]
        folder: Option<String>,

        /// Include files in the recycle bin
        #[arg(long)]
        deleted: bool,

        #[arg(long, default_value = "createdAt")]
        sort_by: String,

        /// Sort ascending instead of descending
        #[arg(long)]
        asc: bool,
    },

    /// Upload a local file
    Upload {
        path: PathBuf,

        /// Display name
        #[arg(short, long)]
        name: Option<String>,

        #[arg(short = 't', long = "type")]
        file_type: Option<String>,

        #[arg(short, long)]
        description: Option<String>,

        /// Comma separated tags
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,

        #[arg(long)]
        folder: Option<String>,
    },

    /// Change file metadata
    Edit {
        id: String,

        #[arg(short, long)]
        name: Option<String>,

        #[arg(short = 't', long = "type")]
        file_type: Option<String>,

        #[arg(short, long)]
        description: Option<String>,
    },

    /// Toggle the starred flag
    Star { id: String },

    /// Toggle the archived flag
    Archive { id: String },

    /// Move a file to the recycle bin
    #[command(alias = "rm")]
    Delete {
        id: String,

        /// Keep showing deleted files in the refreshed list
        #[arg(long)]
        show_deleted: bool,
    },

    /// Restore files from the recycle bin
    Restore {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Delete a file permanently
    Purge { id: String },

    /// Move several files to the recycle bin
    BulkDelete {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Move a file to another folder
    #[command(alias = "mv")]
    Move {
        id: String,

        /// Target folder; omit for the root folder
        folder: Option<String>,
    },

    /// Download a file
    Download {
        id: String,

        #[arg(short, long, value_enum)]
        format: Option<FormatArg>,

        /// Destination directory
        #[arg(short, long, default_value = ".")]
        out: PathBuf,
    },

    /// Copy a file on the server
    Duplicate { id: String },

    /// Share a file with another user
    Share {
        id: String,

        email: String,

        #[arg(short, long, value_enum, default_value_t = PermissionArg::View)]
        permission: PermissionArg,
    },

    /// Show usage statistics of a file
    Stats { id: String },

    /// Show the activity log of a file
    Activity { id: String },

    /// Show operations waiting in the offline queue
    Queue,

    /// Replay the offline queue
    Sync,

    /// Show connection health and recent errors
    Status,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum FormatArg {
    Pdf,
    Doc,
}

impl From<FormatArg> for DownloadFormat {
    fn from(format: FormatArg) -> Self {
        match format {
            FormatArg::Pdf => DownloadFormat::Pdf,
            FormatArg::Doc => DownloadFormat::Doc,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PermissionArg {
    View,
    Comment,
    Edit,
}

impl From<PermissionArg> for SharePermission {
    fn from(permission: PermissionArg) -> Self {
        match permission {
            PermissionArg::View => SharePermission::View,
            PermissionArg::Comment => SharePermission::Comment,
            PermissionArg::Edit => SharePermission::Edit,
        }
    }
}

pub fn sort_order(asc: bool) -> SortOrder {
    if asc {
        SortOrder::Asc
    } else {
        SortOrder::Desc
    }
}
