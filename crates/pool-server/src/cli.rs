use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "honygo-ocr", version, about = "Pooled OCR recognition service")]
pub struct Cli {
    /// Address the HTTP gateway binds to.
    #[arg(long, env = "HONYGO_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Port the HTTP gateway binds to.
    #[arg(long, env = "HONYGO_PORT", default_value_t = 8900)]
    pub port: u16,

    /// Minimum pool size; overrides the configuration file.
    #[arg(long = "min-instances", env = "HONYGO_MIN_INSTANCES")]
    pub min_instances: Option<usize>,

    /// Maximum pool size; overrides the configuration file.
    #[arg(long = "max-instances", env = "HONYGO_MAX_INSTANCES")]
    pub max_instances: Option<usize>,

    /// Verbose logging.
    #[arg(long, default_value_t = false)]
    pub debug: bool,

    /// Interpreter used to spawn OCR worker processes.
    #[arg(long = "python", env = "HONYGO_PYTHON", default_value = "python3")]
    pub python_bin: String,
}
