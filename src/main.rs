use std::error::Error;
use std::fs;
use std::io;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use relaydrop::codec;
use relaydrop::config::{ClientSettings, Cli, Command};
use relaydrop::protocol::FileDescriptor;
use relaydrop::queue::Outcome;
use relaydrop::rate_limit::{Direction, DEFAULT_RATE_CAP};
use relaydrop::recovery::SourceRegistry;
use relaydrop::relay_client::RelayClient;
use relaydrop::relay_transfer::{download_all, RelaySender};
use relaydrop::transfer::{SpeedSampler, TransferRegistry, TransferState};
use relaydrop::{logging, rlog};

/// Exit status when a fetched file was written but failed its digest check.
const EXIT_DIGEST_MISMATCH: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();
    match run().await {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<ExitCode, Box<dyn Error>> {
    let cli = Cli::parse();
    let settings = ClientSettings::from_cli_and_env(&cli);
    let client = Arc::new(RelayClient::new(settings.client_config())?);

    let scope = CancellationToken::new();
    let on_interrupt = scope.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    match cli.command {
        Command::Status => {
            let status = client.status().await?;
            println!(
                "{}: {} ({} session(s), {})",
                client.base_url(),
                status.status,
                status.sessions,
                status.timestamp
            );
        }
        Command::Send { file, peer } => send(client, &file, &peer).await?,
        Command::Fetch {
            session,
            file,
            out,
            digest,
        } => {
            let result = fetch(&client, &session, &file, &out, digest.as_deref(), &scope).await;
            client.end_session().await;
            if result? == Some(false) {
                return Ok(ExitCode::from(EXIT_DIGEST_MISMATCH));
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn send(client: Arc<RelayClient>, path: &Path, peer: &str) -> Result<(), Box<dyn Error>> {
    let bytes = Arc::new(fs::read(path)?);
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());

    let sender = RelaySender::new(
        client,
        Arc::new(SourceRegistry::new()),
        Arc::new(TransferRegistry::new()),
    );
    let Outcome::Done(staged) = sender
        .stage(peer, &file_name, "application/octet-stream", bytes)
        .await?
    else {
        return Err("upload interrupted".into());
    };
    if !staged.failed.is_empty() {
        return Err(format!("chunks failed to upload: {:?}", staged.failed).into());
    }

    println!("session: {}", staged.info.session_id);
    println!("file:    {}", staged.info.file_id);
    println!("digest:  {}", staged.digest);
    println!(
        "fetch with: relaydrop fetch --session {} --file {} --digest {} -o {}",
        staged.info.session_id, staged.info.file_id, staged.digest, file_name
    );
    Ok(())
}

async fn fetch(
    client: &RelayClient,
    sender_session: &str,
    file_id: &str,
    out: &Path,
    expected_digest: Option<&str>,
    scope: &CancellationToken,
) -> Result<Option<bool>, Box<dyn Error>> {
    let status = client.file_status_in(sender_session, file_id).await?;
    if !status.completed {
        return Err(format!(
            "{} of {} chunks uploaded so far, try again later",
            status.uploaded_chunks.len(),
            status.total_chunks
        )
        .into());
    }

    client.start_session().await?;
    client
        .register_file(&FileDescriptor {
            file_id: file_id.to_string(),
            file_name: status.file_name.clone(),
            file_size: status.file_size,
            total_chunks: status.total_chunks,
        })
        .await?;

    let registry = TransferRegistry::new();
    let state = TransferState::new(
        file_id,
        sender_session,
        &status.file_name,
        status.file_size,
        Direction::Download,
        SpeedSampler::relay(DEFAULT_RATE_CAP),
    );
    let key = state.key();
    registry.begin(state);

    let Outcome::Done(assembler) =
        download_all(client, &registry, &key, file_id, status.total_chunks, scope).await?
    else {
        return Err("download interrupted".into());
    };
    let (bytes, digest) = assembler.reassemble()?;
    let verdict = write_fetched(out, &bytes, &digest, expected_digest)?;
    println!(
        "wrote {} ({} bytes, sha256 {})",
        out.display(),
        bytes.len(),
        digest
    );
    Ok(verdict)
}

/// Write the reassembled file, then check it against the expected digest.
/// A mismatch is reported but the file is kept.
fn write_fetched(
    out: &Path,
    bytes: &[u8],
    digest: &str,
    expected_digest: Option<&str>,
) -> io::Result<Option<bool>> {
    fs::write(out, bytes)?;
    let verdict = codec::verify_digest(expected_digest, digest);
    if verdict == Some(false) {
        rlog!(
            "fetch: digest mismatch for {}: expected {}, got {}",
            out.display(),
            expected_digest.unwrap_or_default(),
            digest
        );
        eprintln!("warning: {} does not match the expected digest", out.display());
    }
    Ok(verdict)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatched_download_is_still_written() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("notes.txt");
        let digest = codec::digest_hex(b"hello");

        let verdict = write_fetched(&out, b"hello", &digest, Some(&"00".repeat(32))).unwrap();
        assert_eq!(verdict, Some(false));
        assert_eq!(fs::read(&out).unwrap(), b"hello");

        assert_eq!(write_fetched(&out, b"hello", &digest, Some(&digest)).unwrap(), Some(true));
        assert_eq!(write_fetched(&out, b"hello", &digest, None).unwrap(), None);
    }
}
