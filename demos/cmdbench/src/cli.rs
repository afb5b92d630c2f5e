use clap::Parser;

#[derive(Parser, Debug)]
#[command(about = "Command and completion latency of the simulated HCA.")]
pub struct Args {
    /// Device limits as TOML. Defaults are used when not given.
    #[arg(short, long)]
    pub config: Option<std::path::PathBuf>,

    /// Total number of iterations.
    #[arg(short, long, default_value = "5000")]
    pub num_iters: usize,

    /// Number of warmup iterations.
    #[arg(short, long, default_value = "100")]
    pub warmup: usize,

    /// Send queue depth (max_send_wr).
    #[arg(short, long, default_value = "128")]
    pub tx_depth: u32,

    /// Message size carried in the scatter entry.
    #[arg(short, long, default_value = "4096")]
    pub size: u32,

    /// Skip the polled command run.
    #[arg(long)]
    pub no_polling: bool,

    /// Skip the event-driven command run.
    #[arg(long)]
    pub no_events: bool,
}

#[inline]
pub fn get_args() -> &'static Args {
    use std::sync::OnceLock;
    static ARGS: OnceLock<Args> = OnceLock::new();

    ARGS.get_or_init(|| {
        let args = Args::parse();
        println!("args: {:#?}", args);
        args
    })
}
