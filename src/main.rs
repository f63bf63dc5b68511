use clap::Parser;
use tracing::{info, warn};
use workflows::{AddTwoRandomValuesParallel, AddTwoRandomValuesSerial};

#[derive(Parser, Debug)]
#[command(
    name = "redrive-worker",
    author,
    version,
    about = "durable task runtime demo worker"
)]
struct Cli {
    /// Worker threads in the executor pool
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// How many serial demo tasks to submit
    #[arg(long, default_value_t = 10)]
    serial: usize,

    /// How many parallel demo tasks to submit
    #[arg(long, default_value_t = 10)]
    parallel: usize,

    /// Log at debug level
    #[arg(long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    let max_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    let subscriber = tracing_subscriber::fmt::fmt()
        .pretty()
        .with_max_level(max_level)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("couldn't set up tracing");

    info!("tracing has been started");
    info!("starting runtime with {} workers", cli.workers);

    let rt = redrive::init(cli.workers);

    workflows::register_all(&rt).expect("demo tasks failed to register");

    let mut ids = Vec::new();

    for _ in 0..cli.serial {
        ids.push(
            rt.submit(AddTwoRandomValuesSerial)
                .expect("couldn't submit a serial demo task"),
        );
    }

    for _ in 0..cli.parallel {
        ids.push(
            rt.submit(AddTwoRandomValuesParallel)
                .expect("couldn't submit a parallel demo task"),
        );
    }

    let mut succeeded = 0usize;
    let mut failed = 0usize;

    for id in &ids {
        match rt.wait_for(id) {
            Ok(value) => {
                info!("task {id} finished with {value}");
                succeeded += 1;
            }
            Err(error) => {
                warn!("task {id} failed: {error}");
                failed += 1;
            }
        }
    }

    info!("{succeeded} tasks succeeded, {failed} failed");
    info!("final task table:\n{}", rt.summarize());

    rt.stop();
}
