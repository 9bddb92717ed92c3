//! Certificate tooling: create CAs, generate node keypairs, sign and
//! inspect node certificates.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ed25519_dalek::SigningKey;
use ipnet::Ipv4Net;
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

use overmesh_pki::{
    decode_pem, encode_pem, unix_now, CaPool, CertDetails, MeshCertificate,
    BANNER_ED25519_PRIVATE_KEY, BANNER_PUBLIC_KEY, BANNER_X25519_PRIVATE_KEY,
};

/// overmesh-cert - certificate authority tooling
#[derive(Parser)]
#[command(name = "overmesh-cert")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new self-signed certificate authority
    Ca {
        /// CA name
        #[arg(short, long)]
        name: String,

        /// Validity in days
        #[arg(short, long, default_value = "365")]
        duration: u64,

        /// Output path for the CA private key
        #[arg(long, default_value = "ca.key")]
        out_key: PathBuf,

        /// Output path for the CA certificate
        #[arg(long, default_value = "ca.crt")]
        out_crt: PathBuf,
    },

    /// Generate a node keypair
    Keygen {
        /// Output path for the private key
        #[arg(long, default_value = "host.key")]
        out_key: PathBuf,

        /// Output path for the public key
        #[arg(long, default_value = "host.pub")]
        out_pub: PathBuf,
    },

    /// Sign a node certificate with a CA
    Sign {
        /// CA private key
        #[arg(long, default_value = "ca.key")]
        ca_key: PathBuf,

        /// CA certificate
        #[arg(long, default_value = "ca.crt")]
        ca_crt: PathBuf,

        /// Node name
        #[arg(short, long)]
        name: String,

        /// Overlay address with prefix, e.g. 10.128.0.2/24
        #[arg(short, long)]
        ip: String,

        /// Groups the node belongs to
        #[arg(short, long, value_delimiter = ',')]
        groups: Vec<String>,

        /// Routable subnets behind the node
        #[arg(short, long, value_delimiter = ',')]
        subnets: Vec<String>,

        /// Validity in days
        #[arg(short, long, default_value = "365")]
        duration: u64,

        /// The node's public key; generated fresh when omitted
        #[arg(long)]
        in_pub: Option<PathBuf>,

        /// Output path for the node certificate
        #[arg(long)]
        out_crt: Option<PathBuf>,

        /// Output path for a generated private key
        #[arg(long)]
        out_key: Option<PathBuf>,
    },

    /// Print the contents of a certificate
    Print {
        /// Certificate path
        path: PathBuf,
    },

    /// Verify a certificate against a CA
    Verify {
        /// CA certificate bundle
        #[arg(long)]
        ca: PathBuf,

        /// Certificate to check
        #[arg(long)]
        crt: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Ca {
            name,
            duration,
            out_key,
            out_crt,
        } => cmd_ca(&name, duration, &out_key, &out_crt),
        Commands::Keygen { out_key, out_pub } => cmd_keygen(&out_key, &out_pub),
        Commands::Sign {
            ca_key,
            ca_crt,
            name,
            ip,
            groups,
            subnets,
            duration,
            in_pub,
            out_crt,
            out_key,
        } => cmd_sign(
            &ca_key, &ca_crt, &name, &ip, groups, subnets, duration, in_pub, out_crt, out_key,
        ),
        Commands::Print { path } => cmd_print(&path),
        Commands::Verify { ca, crt } => cmd_verify(&ca, &crt),
    }
}

fn cmd_ca(name: &str, duration_days: u64, out_key: &Path, out_crt: &Path) -> Result<()> {
    if out_key.exists() || out_crt.exists() {
        bail!("refusing to overwrite existing CA material");
    }
    let key = SigningKey::generate(&mut OsRng);
    let now = unix_now();
    let details = CertDetails {
        name: name.to_string(),
        ips: vec![],
        subnets: vec![],
        groups: vec![],
        not_before: now,
        not_after: now + duration_days * 86400,
        public_key: key.verifying_key().to_bytes(),
        is_ca: true,
        issuer: String::new(),
    };
    let cert = MeshCertificate::sign(details, &key)?;

    write_private(out_key, &encode_pem(BANNER_ED25519_PRIVATE_KEY, &key.to_bytes()))?;
    std::fs::write(out_crt, cert.to_pem()?)
        .with_context(|| format!("writing {}", out_crt.display()))?;
    println!("created CA {} ({})", name, cert.fingerprint()?);
    Ok(())
}

fn cmd_keygen(out_key: &Path, out_pub: &Path) -> Result<()> {
    let key = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&key);

    write_private(out_key, &encode_pem(BANNER_X25519_PRIVATE_KEY, &key.to_bytes()))?;
    std::fs::write(out_pub, encode_pem(BANNER_PUBLIC_KEY, public.as_bytes()))
        .with_context(|| format!("writing {}", out_pub.display()))?;
    println!("keypair written to {} / {}", out_key.display(), out_pub.display());
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_sign(
    ca_key_path: &Path,
    ca_crt_path: &Path,
    name: &str,
    ip: &str,
    groups: Vec<String>,
    subnets: Vec<String>,
    duration_days: u64,
    in_pub: Option<PathBuf>,
    out_crt: Option<PathBuf>,
    out_key: Option<PathBuf>,
) -> Result<()> {
    let ca_key_pem = std::fs::read_to_string(ca_key_path)
        .with_context(|| format!("reading {}", ca_key_path.display()))?;
    let (ca_key_raw, _) = decode_pem(BANNER_ED25519_PRIVATE_KEY, &ca_key_pem)?;
    let ca_key_bytes: [u8; 32] = ca_key_raw
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("CA key must be 32 bytes"))?;
    let ca_key = SigningKey::from_bytes(&ca_key_bytes);

    let ca_crt_pem = std::fs::read_to_string(ca_crt_path)
        .with_context(|| format!("reading {}", ca_crt_path.display()))?;
    let (ca_cert, _) = MeshCertificate::from_pem(&ca_crt_pem)?;
    let issuer = ca_cert.fingerprint()?;

    let overlay: Ipv4Net = ip
        .parse()
        .with_context(|| format!("invalid overlay address: {}", ip))?;
    let subnets: Vec<Ipv4Net> = subnets
        .iter()
        .map(|s| s.parse().with_context(|| format!("invalid subnet: {}", s)))
        .collect::<Result<_>>()?;

    // Use the supplied public key, or mint a keypair alongside the cert
    let (public_key, generated) = match &in_pub {
        Some(path) => {
            let pem = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let (raw, _) = decode_pem(BANNER_PUBLIC_KEY, &pem)?;
            let bytes: [u8; 32] = raw
                .as_slice()
                .try_into()
                .map_err(|_| anyhow::anyhow!("public key must be 32 bytes"))?;
            (bytes, None)
        }
        None => {
            let key = StaticSecret::random_from_rng(OsRng);
            let public = PublicKey::from(&key).to_bytes();
            (public, Some(key))
        }
    };

    let now = unix_now();
    let not_after = (now + duration_days * 86400).min(ca_cert.details.not_after);
    let details = CertDetails {
        name: name.to_string(),
        ips: vec![overlay],
        subnets,
        groups,
        not_before: now,
        not_after,
        public_key,
        is_ca: false,
        issuer,
    };
    let cert = MeshCertificate::sign(details, &ca_key)?;

    let crt_path = out_crt.unwrap_or_else(|| PathBuf::from(format!("{}.crt", name)));
    std::fs::write(&crt_path, cert.to_pem()?)
        .with_context(|| format!("writing {}", crt_path.display()))?;
    if let Some(key) = generated {
        let key_path = out_key.unwrap_or_else(|| PathBuf::from(format!("{}.key", name)));
        write_private(&key_path, &encode_pem(BANNER_X25519_PRIVATE_KEY, &key.to_bytes()))?;
    }
    println!("signed certificate for {} ({})", name, cert.fingerprint()?);
    Ok(())
}

fn cmd_print(path: &Path) -> Result<()> {
    let pem = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let (cert, _) = MeshCertificate::from_pem(&pem)?;
    let d = &cert.details;
    println!("name: {}", d.name);
    println!("is_ca: {}", d.is_ca);
    for ip in &d.ips {
        println!("ip: {}", ip);
    }
    for s in &d.subnets {
        println!("subnet: {}", s);
    }
    for g in &d.groups {
        println!("group: {}", g);
    }
    println!("not_before: {}", d.not_before);
    println!("not_after: {}", d.not_after);
    println!("issuer: {}", d.issuer);
    println!("fingerprint: {}", cert.fingerprint()?);
    Ok(())
}

fn cmd_verify(ca: &Path, crt: &Path) -> Result<()> {
    let ca_pem = std::fs::read_to_string(ca).with_context(|| format!("reading {}", ca.display()))?;
    let pool = CaPool::from_pem(&ca_pem)?;

    let crt_pem =
        std::fs::read_to_string(crt).with_context(|| format!("reading {}", crt.display()))?;
    let (cert, _) = MeshCertificate::from_pem(&crt_pem)?;

    pool.verify(&cert, unix_now())?;
    println!("ok");
    Ok(())
}

fn write_private(path: &Path, pem: &str) -> Result<()> {
    std::fs::write(path, pem).with_context(|| format!("writing {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}
