//! secmod: command-line front end for secmod-lib.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rayon::prelude::*;
use secmod_lib::tls::{self, SslOption, SslSocket};
use secmod_lib::{
    context, data_to_hex, hash_buf, oid, pkcs12_export, CertDb, CertTrust, Certificate, Dn,
    NicknameKind, OidTag, OpenMode, Pkcs12Decoder,
};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "secmod",
    version,
    about = "Names, digests, certificate databases, PKCS#12 containers and TLS echo",
    after_help = "EXAMPLES:\n\
                  \n  secmod oid CN 2.5.4.10 SEC_OID_SHA256\
                  \n  secmod dn 'CN=www.example.com,O=Example,C=US'\
                  \n  secmod digest --alg sha1 *.pem\
                  \n  secmod certdb --dir db list --kind user\
                  \n  secmod pk12 list --password secret bundle.p12\
                  \n  secmod echo-server --dir db --nickname test_server\
                  \n  secmod echo-client --dir db --host localhost --port 4433 hello"
)]
struct Cli {
    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve OIDs given as names, tags or dotted decimal
    Oid {
        tokens: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Parse a distinguished name and show its RDNs
    Dn {
        name: String,
        #[arg(long)]
        json: bool,
    },
    /// Hash files (stdin if none), in parallel
    Digest {
        files: Vec<PathBuf>,
        /// md5, sha1, sha256, sha384 or sha512
        #[arg(long, default_value = "sha256")]
        alg: String,
    },
    /// Inspect or populate a certificate database
    Certdb {
        #[arg(long)]
        dir: PathBuf,
        #[command(subcommand)]
        action: CertdbAction,
    },
    /// PKCS#12 containers
    Pk12 {
        #[command(subcommand)]
        action: Pk12Action,
    },
    /// Serve the newline echo protocol over TLS
    EchoServer {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        db_password: Option<String>,
        /// Nickname of the server certificate
        #[arg(long)]
        nickname: String,
        #[arg(long, default_value = "127.0.0.1:4433")]
        bind: String,
        /// Ask clients for a certificate
        #[arg(long)]
        request_cert: bool,
        /// Reject clients without a certificate
        #[arg(long)]
        require_cert: bool,
        /// Stop after this many connections
        #[arg(long)]
        count: Option<usize>,
    },
    /// Send one line to an echo server and print the reply
    EchoClient {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        db_password: Option<String>,
        #[arg(long, default_value = "localhost")]
        host: String,
        #[arg(long, default_value_t = 4433)]
        port: u16,
        /// Client certificate nickname (chosen from the CA hints if omitted)
        #[arg(long)]
        nickname: Option<String>,
        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
        message: String,
    },
}

#[derive(Subcommand)]
enum CertdbAction {
    /// List stored certificates
    List {
        #[arg(long, value_enum, default_value = "all")]
        kind: Kind,
        #[arg(long)]
        json: bool,
    },
    /// Create an empty database
    Create {
        #[arg(long)]
        password: Option<String>,
    },
    /// Add a PEM or DER certificate
    Add {
        file: PathBuf,
        #[arg(long)]
        nickname: Option<String>,
        /// Trust string such as "CT,C,C"
        #[arg(long, default_value = ",,")]
        trust: String,
    },
}

#[derive(Subcommand)]
enum Pk12Action {
    /// Decode a container and list its bags
    List {
        file: PathBuf,
        #[arg(long)]
        password: String,
        #[arg(long)]
        json: bool,
    },
    /// Import certificates and keys into a database
    Import {
        file: PathBuf,
        #[arg(long)]
        password: String,
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        db_password: Option<String>,
    },
    /// Export a certificate, its key and chain
    Export {
        nickname: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        db_password: Option<String>,
        #[arg(short, long)]
        output: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Kind {
    All,
    User,
    Server,
    Ca,
}

impl From<Kind> for NicknameKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::All => NicknameKind::All,
            Kind::User => NicknameKind::User,
            Kind::Server => NicknameKind::Server,
            Kind::Ca => NicknameKind::Ca,
        }
    }
}

/// Maximum size of a file or stdin input (64 MiB).
const MAX_INPUT_BYTES: u64 = 64 * 1024 * 1024;

fn read_input(file: Option<&Path>) -> Result<Vec<u8>> {
    match file {
        Some(path) => {
            let meta = std::fs::metadata(path)
                .with_context(|| format!("Failed to stat file: {}", path.display()))?;
            if meta.len() > MAX_INPUT_BYTES {
                bail!(
                    "File too large ({} bytes, max {} bytes): {}",
                    meta.len(),
                    MAX_INPUT_BYTES,
                    path.display()
                );
            }
            std::fs::read(path).with_context(|| format!("Failed to read file: {}", path.display()))
        }
        None => {
            let mut buf = Vec::new();
            std::io::stdin()
                .take(MAX_INPUT_BYTES)
                .read_to_end(&mut buf)
                .context("Failed to read from stdin")?;
            Ok(buf)
        }
    }
}

fn parse_digest(name: &str) -> Result<OidTag> {
    let tag = match name.to_ascii_lowercase().as_str() {
        "md5" => OidTag::Md5,
        "sha1" => OidTag::Sha1,
        "sha256" => OidTag::Sha256,
        "sha384" => OidTag::Sha384,
        "sha512" => OidTag::Sha512,
        _ => oid::resolve(name).with_context(|| format!("Unknown digest: {name}"))?,
    };
    Ok(tag)
}

/// Open a database directory and unlock its key slot when a password is
/// given.
fn open_db(dir: &Path, mode: OpenMode, password: Option<&str>) -> Result<CertDb> {
    let db = CertDb::open(dir, mode)
        .with_context(|| format!("Failed to open database: {}", dir.display()))?;
    if let Some(password) = password {
        db.internal_key_slot()
            .login(password)
            .context("Failed to unlock the key slot")?;
    }
    Ok(db)
}

fn init_logging(verbose: bool) {
    let default = if verbose { "secmod=debug,secmod_lib=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Oid { tokens, json } => run_oid(&tokens, json),
        Commands::Dn { name, json } => run_dn(&name, json),
        Commands::Digest { files, alg } => run_digest(&files, &alg),
        Commands::Certdb { dir, action } => run_certdb(&dir, action),
        Commands::Pk12 { action } => run_pk12(action),
        Commands::EchoServer {
            dir,
            db_password,
            nickname,
            bind,
            request_cert,
            require_cert,
            count,
        } => run_echo_server(
            &dir,
            db_password.as_deref(),
            &nickname,
            &bind,
            request_cert,
            require_cert,
            count,
        ),
        Commands::EchoClient {
            dir,
            db_password,
            host,
            port,
            nickname,
            timeout_secs,
            message,
        } => run_echo_client(
            &dir,
            db_password,
            &host,
            port,
            nickname,
            Duration::from_secs(timeout_secs),
            &message,
        ),
    }
}

fn run_oid(tokens: &[String], json: bool) -> Result<()> {
    let mut rows = Vec::with_capacity(tokens.len());
    for token in tokens {
        let tag = oid::resolve(token.as_str()).with_context(|| format!("Cannot resolve {token}"))?;
        rows.push(tag);
    }
    if json {
        let out: Vec<serde_json::Value> = rows
            .iter()
            .map(|tag| {
                serde_json::json!({
                    "tag": tag,
                    "oid": tag.oid(),
                    "short_name": tag.short_name(),
                    "description": tag.description(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        for tag in rows {
            println!(
                "{:<40} {:<24} {}",
                tag.registry_name(),
                oid::dotted_decimal(tag)?,
                tag.description()
            );
        }
    }
    Ok(())
}

fn run_dn(name: &str, json: bool) -> Result<()> {
    let dn = Dn::parse(name).with_context(|| format!("Invalid distinguished name: {name}"))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&dn)?);
        return Ok(());
    }
    println!("{}", dn);
    for (index, rdn) in dn.iter().enumerate() {
        for ava in rdn.iter() {
            println!("  [{}] {} ({}) = {}", index, ava.key(), ava.tag().oid(), ava.value());
        }
    }
    Ok(())
}

fn run_digest(files: &[PathBuf], alg: &str) -> Result<()> {
    let tag = parse_digest(alg)?;
    if files.is_empty() {
        let data = read_input(None)?;
        println!("{}  -", data_to_hex(&hash_buf(tag, &data)?, ""));
        return Ok(());
    }

    let results: Vec<(String, Result<String>)> = files
        .par_iter()
        .map(|path| {
            let hex = read_input(Some(path.as_path()))
                .and_then(|data| Ok(hash_buf(tag, &data)?))
                .map(|d| data_to_hex(&d, ""));
            (path.display().to_string(), hex)
        })
        .collect();

    let mut failures = 0;
    for (path, result) in results {
        match result {
            Ok(hex) => println!("{}  {}", hex, path),
            Err(e) => {
                failures += 1;
                eprintln!("{}: {:#}", path, e);
            }
        }
    }
    if failures > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn run_certdb(dir: &Path, action: CertdbAction) -> Result<()> {
    match action {
        CertdbAction::List { kind, json } => {
            let db = open_db(dir, OpenMode::ReadOnly, None)?;
            let wanted = db.get_cert_nicknames(kind.into());
            let entries: Vec<(String, Certificate, CertTrust)> = db
                .certificates()
                .into_iter()
                .filter(|(nickname, _, _)| wanted.contains(nickname))
                .collect();
            if json {
                let out: Vec<serde_json::Value> = entries
                    .iter()
                    .map(|(nickname, cert, trust)| {
                        serde_json::json!({
                            "nickname": nickname,
                            "subject": cert.subject(),
                            "issuer": cert.issuer(),
                            "trust": trust.to_string(),
                            "sha256": cert.sha256_fingerprint(),
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                for (nickname, cert, trust) in entries {
                    println!("{:<32} {:<10} {}", nickname, trust, cert.subject());
                }
            }
        }
        CertdbAction::Create { password } => {
            CertDb::create(dir, password.as_deref())
                .with_context(|| format!("Failed to create database: {}", dir.display()))?;
        }
        CertdbAction::Add {
            file,
            nickname,
            trust,
        } => {
            let trust: CertTrust = trust.parse()?;
            let input = read_input(Some(file.as_path()))?;
            let cert = Certificate::from_bytes(&input)
                .with_context(|| format!("Failed to parse certificate: {}", file.display()))?;
            let db = open_db(dir, OpenMode::ReadWrite, None)?;
            let stored = db.add_cert(&cert, nickname.as_deref(), trust)?;
            println!("{}", stored);
        }
    }
    Ok(())
}

fn run_pk12(action: Pk12Action) -> Result<()> {
    match action {
        Pk12Action::List {
            file,
            password,
            json,
        } => {
            let scratch = CertDb::in_memory()?;
            let decoder = Pkcs12Decoder::new(file.as_path(), &password, &scratch.internal_key_slot())
                .with_context(|| format!("Failed to decode {}", file.display()))?;
            if json {
                let bags: Vec<_> = decoder.iter().collect();
                println!("{}", serde_json::to_string_pretty(&bags)?);
            } else {
                for (index, bag) in decoder.iter().enumerate() {
                    println!("{}: {}", index, bag);
                }
            }
        }
        Pk12Action::Import {
            file,
            password,
            dir,
            db_password,
        } => {
            let db = open_db(&dir, OpenMode::ReadWrite, db_password.as_deref())?;
            let decoder = Pkcs12Decoder::new(file.as_path(), &password, &db.internal_key_slot())
                .with_context(|| format!("Failed to decode {}", file.display()))?;
            for nickname in decoder.database_import(&db)? {
                println!("{}", nickname);
            }
        }
        Pk12Action::Export {
            nickname,
            password,
            dir,
            db_password,
            output,
        } => {
            let db = open_db(&dir, OpenMode::ReadOnly, db_password.as_deref())?;
            let der = pkcs12_export(&db, &nickname, &password, None)?;
            std::fs::write(&output, der)
                .with_context(|| format!("Failed to write {}", output.display()))?;
        }
    }
    Ok(())
}

fn run_echo_server(
    dir: &Path,
    db_password: Option<&str>,
    nickname: &str,
    bind: &str,
    request_cert: bool,
    require_cert: bool,
    count: Option<usize>,
) -> Result<()> {
    let db = open_db(dir, OpenMode::ReadOnly, db_password)?;
    let cert = db.find_cert_from_nickname(nickname)?;
    let key = db
        .find_key_by_any_cert(&cert, None)
        .with_context(|| format!("No usable key for {nickname}"))?;

    tls::config_server_session_id_cache(256)?;
    let mut server = SslSocket::new();
    server.set_certdb(db)?;
    server.set_option(SslOption::RequestCertificate, request_cert)?;
    server.set_option(SslOption::RequireCertificate, require_cert)?;
    server.config_secure_server(&cert, &key)?;
    server.bind(bind)?;
    server.listen()?;
    tracing::info!(addr = %server.local_addr()?, "listening");

    let mut served = 0;
    while count.map_or(true, |limit| served < limit) {
        served += 1;
        let mut child = match server.accept(None) {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };
        if let Err(e) = serve_echo(&mut child) {
            tracing::warn!(peer = ?child.peer_name(), error = %e, "connection failed");
        }
        let _ = child.close();
    }
    server.close()?;
    tls::shutdown_server_session_id_cache()?;
    Ok(())
}

fn serve_echo(child: &mut SslSocket) -> Result<()> {
    loop {
        let line = child.readline()?;
        if !line.ends_with('\n') {
            break;
        }
        let reply = format!("{{{}}}\n", line.trim_end_matches(['\r', '\n']));
        child.send(reply.as_bytes())?;
    }
    child.shutdown()?;
    Ok(())
}

fn run_echo_client(
    dir: &Path,
    db_password: Option<String>,
    host: &str,
    port: u16,
    nickname: Option<String>,
    timeout: Duration,
    message: &str,
) -> Result<()> {
    let db = context::init(dir)
        .with_context(|| format!("Failed to open database: {}", dir.display()))?;
    let mut client = SslSocket::new();
    client.set_hostname(host)?;
    client.set_auth_certificate_callback(tls::auth_certificate_callback(db.clone()))?;
    client.set_client_auth_data_callback(tls::client_auth_data_callback(
        db,
        nickname,
        db_password,
    ))?;
    client.set_handshake_callback(|sock| {
        if let Some(info) = sock.connection_info() {
            tracing::info!(%info, "handshake complete");
        }
    })?;

    let result = exchange(&mut client, host, port, timeout, message);
    if let Some(e) = client.last_callback_error() {
        tracing::warn!(error = %e, "callback failure");
    }
    let _ = client.close();
    tls::clear_session_cache();
    context::shutdown()?;
    let reply = result?;
    println!("{}", reply.trim_end());
    Ok(())
}

fn exchange(
    client: &mut SslSocket,
    host: &str,
    port: u16,
    timeout: Duration,
    message: &str,
) -> Result<String> {
    client
        .connect((host, port), Some(timeout))
        .with_context(|| format!("Failed to connect to {host}:{port}"))?;
    client.send(format!("{}\n", message).as_bytes())?;
    let reply = client.readline()?;
    client.shutdown()?;
    Ok(reply)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn digest_names() {
        assert_eq!(parse_digest("SHA256").unwrap(), OidTag::Sha256);
        assert_eq!(parse_digest("md5").unwrap(), OidTag::Md5);
        assert_eq!(parse_digest("SEC_OID_SHA1").unwrap(), OidTag::Sha1);
        assert!(parse_digest("nonsense").is_err());
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["secmod", "oid", "CN", "2.5.4.10"]).unwrap();
        assert!(matches!(cli.command, Commands::Oid { ref tokens, .. } if tokens.len() == 2));

        let cli = Cli::try_parse_from([
            "secmod", "pk12", "export", "nick", "--password", "pw", "--dir", "db", "-o", "out.p12",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Pk12 {
                action: Pk12Action::Export { .. }
            }
        ));

        assert!(Cli::try_parse_from(["secmod", "echo-client", "--dir", "db"]).is_err());
    }

    #[test]
    fn read_input_rejects_missing_file() {
        let err = read_input(Some(Path::new("/nonexistent/secmod-input"))).unwrap_err();
        assert!(err.to_string().contains("Failed to stat file"));
    }
}
