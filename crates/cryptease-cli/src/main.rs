//! crypt: cryptease command-line interface
//!
//! Commands:
//!   encrypt <file> [-o <out>]   - encrypt with a passphrase (stdout when -o is absent)
//!   decrypt <file> [-o <out>]   - decrypt; the key is rebuilt from the file header
//!   inspect <file>              - print header fields without decrypting
//!   keyring get | seal          - query or write the encrypted JSON keyring
//!   config show                 - display current configuration
//!
//! `<file>` may be a path, a `file://` URI, or `-` for stdin.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use secrecy::{ExposeSecret, SecretString};
use std::fs::File;
use std::io::{self, BufRead, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use cryptease_core::config::{default_config_path, CrypteaseConfig};
use cryptease_core::expand_tilde;
use cryptease_envelope::header::LENGTH_PREFIX_SIZE;
use cryptease_envelope::{
    decrypt_after_header, decrypt_stream, derive_key, derive_key_from_header, encrypt_stream,
    key_from_source, read_header, read_header_prefix, write_atomically, DecryptStream,
    EnvelopeError, KeyOrigin,
};
use cryptease_keyring::{Keyring, KeyringError};

/// Invalid answers tolerated by the overwrite prompt before giving up.
const OVERWRITE_ATTEMPTS: usize = 3;

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "crypt",
    version,
    about = "Passphrase file encryption",
    long_about = "crypt: encrypt and decrypt files with a passphrase. The encrypted file \
                  carries its own salt and cipher parameters, so the passphrase is all \
                  that is needed to decrypt it."
)]
struct Cli {
    /// Path to config.toml (default: ~/.config/cryptease/config.toml)
    #[arg(long, short = 'c', env = "CRYPTEASE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log level filter, e.g. "info" or "cryptease_envelope=debug" (RUST_LOG wins)
    #[arg(long, env = "CRYPTEASE_LOG", global = true)]
    log: Option<String>,

    /// Log output format
    #[arg(long, value_enum, global = true)]
    log_format: Option<LogFormat>,

    /// Enable debug messages (same as --log debug)
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Encrypt a file with a passphrase (asked twice unless set in the environment)
    Encrypt(Transform),

    /// Decrypt a file; salt and parameters are read from its header
    Decrypt(Transform),

    /// Print the envelope header of an encrypted file
    Inspect {
        /// Encrypted file, `file://` URI, or `-` for stdin
        file: String,
    },

    /// Encrypted JSON keyring of study passphrases
    Keyring {
        #[command(subcommand)]
        action: KeyringAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args, Debug)]
struct Transform {
    /// Input file, `file://` URI, or `-` for stdin
    file: String,

    /// Output file (default: stdout)
    #[arg(short = 'o', long = "output-file")]
    output: Option<PathBuf>,

    /// Overwrite an existing output file without asking
    #[arg(long, short = 'f')]
    force: bool,
}

#[derive(Subcommand, Debug)]
enum KeyringAction {
    /// Print a secret from the keyring (no trailing newline)
    Get {
        /// Keyring file (overrides config keyring.path)
        #[arg(long, env = "CRYPTEASE_KEYRING")]
        keyring: Option<PathBuf>,

        #[command(flatten)]
        query: KeyringQuery,
    },

    /// Encrypt a plaintext JSON document as the keyring
    Seal {
        /// Plaintext JSON document
        input: PathBuf,

        /// Keyring file (overrides config keyring.path)
        #[arg(long, env = "CRYPTEASE_KEYRING")]
        keyring: Option<PathBuf>,

        /// Replace an existing keyring without asking
        #[arg(long, short = 'f')]
        force: bool,
    },
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct KeyringQuery {
    /// Passphrase for a PHOENIX study (kitchen/SECRETS/<study>)
    #[arg(long)]
    phoenix_study: Option<String>,

    /// Passphrase for a Beiwe study (beiwe/SECRETS/<study>)
    #[arg(long)]
    beiwe_study: Option<String>,

    /// Arbitrary `/`-separated path, e.g. kitchen/SECRETS/STUDY
    #[arg(long)]
    path: Option<String>,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

/// Failures that are the user's call rather than a fault.
#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("passphrases do not match")]
    PassphraseMismatch,

    #[error("not overwriting existing file: {}", .0.display())]
    OverwriteDeclined(PathBuf),

    #[error("unsupported input scheme \"{0}\" (local files and stdin only)")]
    UnsupportedScheme(String),
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::debug!("{err:?}");
            eprintln!("crypt: {err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = CrypteaseConfig::load(&config_path)
        .with_context(|| format!("loading config: {}", config_path.display()))?;

    let level = if cli.debug {
        "debug".to_string()
    } else {
        cli.log.clone().unwrap_or_else(|| config.logging.level.clone())
    };
    let format = cli.log_format.unwrap_or_else(|| {
        <LogFormat as ValueEnum>::from_str(&config.logging.format, true).unwrap_or(LogFormat::Text)
    });
    init_logging(&level, format);
    tracing::debug!(config = %config_path.display(), "configuration loaded");

    match cli.command {
        Commands::Encrypt(args) => cmd_encrypt(&config, &args),
        Commands::Decrypt(args) => cmd_decrypt(&config, &args),
        Commands::Inspect { file } => cmd_inspect(&file),
        Commands::Keyring { action: KeyringAction::Get { keyring, query } } => {
            cmd_keyring_get(&config, keyring.as_deref(), &query)
        }
        Commands::Keyring { action: KeyringAction::Seal { input, keyring, force } } => {
            cmd_keyring_seal(&config, &input, keyring.as_deref(), force)
        }
        Commands::Config { action: ConfigAction::Show } => cmd_config_show(&config, &config_path),
    }
}

/// Logs go to stderr; stdout carries payload bytes.
fn init_logging(level: &str, format: LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(io::stderr))
                .init();
        }
    }
}

/// 0 ok, 1 other, 2 malformed envelope, 3 I/O, 4 user abort or wrong keyring passphrase.
fn exit_code(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<CliError>() {
            return match e {
                CliError::UnsupportedScheme(_) => 1,
                CliError::PassphraseMismatch | CliError::OverwriteDeclined(_) => 4,
            };
        }
        if let Some(e) = cause.downcast_ref::<EnvelopeError>() {
            return envelope_exit_code(e);
        }
        if let Some(e) = cause.downcast_ref::<KeyringError>() {
            return match e {
                KeyringError::Envelope(inner) => envelope_exit_code(inner),
                // Garbage plaintext: a wrong passphrase, not a damaged file.
                KeyringError::Json(_) => 4,
                KeyringError::NotFound(_) | KeyringError::NotAString(_) => 1,
            };
        }
        if cause.downcast_ref::<io::Error>().is_some() {
            return 3;
        }
    }
    1
}

fn envelope_exit_code(err: &EnvelopeError) -> u8 {
    match err {
        EnvelopeError::Format(_) | EnvelopeError::UnsupportedOrigin { .. } => 2,
        EnvelopeError::Io(_) => 3,
        EnvelopeError::KeyDerivation(_) => 1,
    }
}

// ── Input / output helpers ────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
enum Input {
    Stdin,
    File(PathBuf),
}

fn parse_input(spec: &str) -> Result<Input, CliError> {
    if spec == "-" {
        return Ok(Input::Stdin);
    }
    if let Some(path) = spec.strip_prefix("file://") {
        return Ok(Input::File(PathBuf::from(path)));
    }
    if let Some((scheme, _)) = spec.split_once("://") {
        return Err(CliError::UnsupportedScheme(scheme.to_string()));
    }
    Ok(Input::File(expand_tilde(Path::new(spec))))
}

fn open_input(path: &Path) -> Result<File> {
    File::open(path).with_context(|| format!("opening {}", path.display()))
}

/// Passphrase from `env_var` if set, otherwise prompted on the terminal.
fn read_passphrase(env_var: &str, confirm: bool) -> Result<SecretString> {
    if let Ok(value) = std::env::var(env_var) {
        tracing::debug!(env_var, "passphrase taken from environment");
        return Ok(SecretString::from(value));
    }

    let first = SecretString::from(
        rpassword::prompt_password("enter passphrase: ").context("reading passphrase")?,
    );
    if confirm {
        let second = SecretString::from(
            rpassword::prompt_password("re-enter passphrase: ").context("reading passphrase")?,
        );
        if first.expose_secret() != second.expose_secret() {
            return Err(CliError::PassphraseMismatch.into());
        }
    }
    Ok(first)
}

/// Fail unless `path` may be written: absent, `--force`, or confirmed interactively.
fn ensure_writable(path: &Path, force: bool, input: &Input) -> Result<()> {
    let path = expand_tilde(path);
    if force || !path.exists() {
        return Ok(());
    }
    if *input == Input::Stdin {
        anyhow::bail!(
            "{} exists and stdin is the input; pass --force to overwrite",
            path.display()
        );
    }

    let confirmed = confirm_overwrite(&mut io::stdin().lock(), &mut io::stderr())
        .context("reading overwrite confirmation")?;
    if confirmed {
        Ok(())
    } else {
        Err(CliError::OverwriteDeclined(path).into())
    }
}

fn confirm_overwrite<R: BufRead, W: Write>(answers: &mut R, prompt: &mut W) -> io::Result<bool> {
    for _ in 0..OVERWRITE_ATTEMPTS {
        write!(prompt, "overwrite existing file [y/n]: ")?;
        prompt.flush()?;

        let mut line = String::new();
        if answers.read_line(&mut line)? == 0 {
            return Ok(false);
        }
        match line.trim().to_ascii_lowercase().as_str() {
            "y" => return Ok(true),
            "n" => return Ok(false),
            _ => {}
        }
    }
    Ok(false)
}

/// Send chunks to `output` atomically, or to stdout when no output is given.
fn emit<I>(chunks: I, output: Option<&Path>, temp_prefix: &str) -> Result<()>
where
    I: Iterator<Item = cryptease_envelope::Result<Vec<u8>>>,
{
    match output {
        Some(path) => {
            tracing::info!("saving {}", path.display());
            write_atomically(path, chunks, temp_prefix)
                .with_context(|| format!("writing {}", path.display()))?;
        }
        None => {
            let mut stdout = io::stdout().lock();
            for chunk in chunks {
                stdout.write_all(&chunk?)?;
            }
            stdout.flush()?;
        }
    }
    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// ── `crypt encrypt` ───────────────────────────────────────────────────────────

fn cmd_encrypt(config: &CrypteaseConfig, args: &Transform) -> Result<()> {
    let input = parse_input(&args.file)?;
    if let Some(out) = &args.output {
        ensure_writable(out, args.force, &input)?;
    }

    let passphrase = read_passphrase(&config.passphrase.env_var, true)?;
    let key = derive_key(&passphrase, None).context("deriving key")?;

    let source: Box<dyn Read> = match &input {
        Input::Stdin => Box::new(io::stdin().lock()),
        Input::File(path) => Box::new(open_input(path)?),
    };
    let stream = encrypt_stream(source, &key, config.envelope.chunk_size)?;
    emit(stream, args.output.as_deref(), &config.envelope.temp_prefix_encrypt)
}

// ── `crypt decrypt` ───────────────────────────────────────────────────────────

fn cmd_decrypt(config: &CrypteaseConfig, args: &Transform) -> Result<()> {
    let input = parse_input(&args.file)?;
    if let Some(out) = &args.output {
        ensure_writable(out, args.force, &input)?;
    }

    let passphrase = read_passphrase(&config.passphrase.env_var, false)?;
    let chunk_size = config.envelope.chunk_size;
    let temp_prefix = &config.envelope.temp_prefix_decrypt;

    match input {
        Input::File(path) => {
            let mut file = open_input(&path)?;
            let key = key_from_source(&mut file, &passphrase)
                .with_context(|| format!("rebuilding key from {}", path.display()))?;
            let stream = decrypt_stream(file, &key, chunk_size)?;
            emit(stream, args.output.as_deref(), temp_prefix)
        }
        Input::Stdin => {
            let stream = decrypt_piped(io::stdin().lock(), &passphrase, chunk_size)
                .context("decrypting stdin")?;
            emit(stream, args.output.as_deref(), temp_prefix)
        }
    }
}

/// Header, then key, then payload, all from one forward-only source.
fn decrypt_piped<R: Read>(
    mut source: R,
    passphrase: &SecretString,
    chunk_size: usize,
) -> Result<DecryptStream<R>> {
    let (header, _) = read_header_prefix(&mut source).context("reading envelope header")?;
    let key = derive_key_from_header(&header, passphrase)?;
    Ok(decrypt_after_header(source, &header, &key, chunk_size)?)
}

// ── `crypt inspect` ───────────────────────────────────────────────────────────

fn cmd_inspect(file: &str) -> Result<()> {
    let (header, offset) = match parse_input(file)? {
        Input::Stdin => read_header_prefix(&mut io::stdin().lock())?,
        Input::File(path) => read_header(&mut open_input(&path)?)
            .with_context(|| format!("reading header of {}", path.display()))?,
    };

    println!("metadata length: {}", offset - LENGTH_PREFIX_SIZE as u64);
    println!("payload offset:  {offset}");
    println!(
        "cipher:          AES-{} {}",
        header.cipher.key_size_bits, header.cipher.mode
    );
    println!("kdf:             {}", header.kdf.kind());
    match &header.kdf {
        KeyOrigin::Pbkdf2 {
            hash_algorithm,
            iterations,
            salt,
        } => {
            println!("  hash:          {hash_algorithm}");
            println!("  iterations:    {iterations}");
            println!("  salt:          {}", hex(salt));
        }
        KeyOrigin::Random { source_tag } => {
            println!("  source:        {source_tag}");
        }
    }
    println!("iv:              {}", hex(&header.iv));
    Ok(())
}

// ── `crypt keyring` ───────────────────────────────────────────────────────────

fn resolve_keyring_path(config: &CrypteaseConfig, override_path: Option<&Path>) -> PathBuf {
    override_path
        .map(expand_tilde)
        .unwrap_or_else(|| config.keyring_path())
}

fn cmd_keyring_get(
    config: &CrypteaseConfig,
    keyring_override: Option<&Path>,
    query: &KeyringQuery,
) -> Result<()> {
    let path = resolve_keyring_path(config, keyring_override);
    let passphrase = read_passphrase(&config.keyring.passphrase_env, false)?;
    let keyring = Keyring::open(&path, &passphrase)
        .with_context(|| format!("opening keyring {}", path.display()))?;

    let secret = match (&query.phoenix_study, &query.beiwe_study, &query.path) {
        (Some(study), _, _) => keyring.phoenix_study(study)?,
        (_, Some(study), _) => keyring.beiwe_study(study)?,
        (_, _, Some(q)) => keyring.lookup(q)?,
        _ => anyhow::bail!("one of --phoenix-study, --beiwe-study or --path is required"),
    };

    let mut stdout = io::stdout().lock();
    stdout.write_all(secret.as_bytes())?;
    stdout.flush()?;
    Ok(())
}

fn cmd_keyring_seal(
    config: &CrypteaseConfig,
    input: &Path,
    keyring_override: Option<&Path>,
    force: bool,
) -> Result<()> {
    let path = resolve_keyring_path(config, keyring_override);

    let content = std::fs::read_to_string(input)
        .with_context(|| format!("reading {}", input.display()))?;
    let doc: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("parsing {} as JSON", input.display()))?;

    ensure_writable(&path, force, &Input::File(input.to_path_buf()))?;
    let passphrase = read_passphrase(&config.keyring.passphrase_env, true)?;
    let written = Keyring::seal(&path, &doc, &passphrase)
        .with_context(|| format!("sealing keyring {}", path.display()))?;

    println!("sealed {} ({written} bytes)", path.display());
    Ok(())
}

// ── `crypt config show` ───────────────────────────────────────────────────────

fn cmd_config_show(config: &CrypteaseConfig, config_path: &Path) -> Result<()> {
    let config_path = expand_tilde(config_path);
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}
