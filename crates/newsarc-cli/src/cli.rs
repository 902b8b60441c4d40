use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "newsarc", version, about = "Mirror NNTP list archives into a local database")]
pub(crate) struct Cli {
    /// Disable waiting during a download
    #[arg(short, long)]
    pub(crate) aggressive: bool,
    /// Perform a trial run with no changes made
    #[arg(short, long)]
    pub(crate) dry_run: bool,
    /// Fetch the n most recent messages
    #[arg(short, long)]
    pub(crate) number: Option<u64>,
    /// Keep going in case of errors
    #[arg(short, long)]
    pub(crate) keep_going: bool,
    /// List all available groups and exit
    #[arg(short, long)]
    pub(crate) list_groups: bool,
    /// Set the log level
    #[arg(long, default_value = "warn")]
    pub(crate) log: String,
    /// First message in range
    #[arg(short, long)]
    pub(crate) start: Option<u64>,
    /// Retrieve only new messages
    #[arg(short, long)]
    pub(crate) update: bool,
    /// Only update references in the database and exit
    #[arg(short = 'r', long)]
    pub(crate) update_references: bool,
    /// Reduce output on stdout
    #[arg(short, long)]
    pub(crate) quiet: bool,
    /// Newsgroups to mirror
    pub(crate) groups: Vec<String>,
}
