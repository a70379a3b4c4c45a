use std::{io::BufRead, thread};

use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::mpsc,
};
use tracing::{info, warn};

use crate::{cli::ClientArgs, session::SENTINEL};

pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut reader, mut writer) = establish_connection(&args).await?;
    let mut stdin = spawn_stdin_reader();

    let name = match args.name {
        Some(name) => name,
        None => prompt_name(&mut stdin).await?,
    };
    send_line(&mut writer, &name).await?;
    write_stdout(&format!("*** connected to {} as {name}", args.server)).await?;

    run_client_loop(&mut reader, &mut writer, &mut stdin).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn establish_connection(args: &ClientArgs) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);

    let (reader, writer) = stream.into_split();
    Ok((BufReader::new(reader), writer))
}

/// Reads stdin on a plain thread so a pending read never holds up runtime shutdown.
fn spawn_stdin_reader() -> mpsc::Receiver<io::Result<String>> {
    let (tx, rx) = mpsc::channel(16);
    thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

async fn prompt_name(stdin: &mut mpsc::Receiver<io::Result<String>>) -> Result<String> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(b"Enter name: ").await?;
    stdout.flush().await?;

    match stdin.recv().await {
        Some(line) => Ok(line?.trim_end_matches('\r').to_string()),
        None => anyhow::bail!("stdin closed before a name was entered"),
    }
}

async fn run_client_loop(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    stdin: &mut mpsc::Receiver<io::Result<String>>,
) -> Result<()> {
    let mut relayed = String::new();
    loop {
        select! {
            bytes_read = reader.read_line(&mut relayed) => {
                if !handle_relayed_line(bytes_read, &relayed).await? {
                    break;
                }
                relayed.clear();
            }
            input = stdin.recv() => {
                if !handle_stdin_input(input, writer).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_relayed_line(bytes_read: io::Result<usize>, line: &str) -> Result<bool> {
    if bytes_read? == 0 {
        write_stdout("*** relay closed the connection").await?;
        return Ok(false);
    }
    write_stdout(line.trim_end_matches(['\r', '\n'])).await?;
    Ok(true)
}

async fn handle_stdin_input(input: Option<io::Result<String>>, writer: &mut OwnedWriteHalf) -> Result<bool> {
    // End of stdin leaves the chat the same way typing BYE does.
    let input = input.transpose()?.unwrap_or_else(|| "BYE".to_string());
    let text = input.trim_end_matches('\r');
    if format!("{text}\n") == SENTINEL {
        writer.write_all(SENTINEL.as_bytes()).await?;
        writer.flush().await?;
        write_stdout("*** connection shut down").await?;
        return Ok(false);
    }

    send_line(writer, text).await?;
    Ok(true)
}

async fn send_line(writer: &mut OwnedWriteHalf, text: &str) -> Result<()> {
    writer.write_all(text.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shut down client writer cleanly");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
