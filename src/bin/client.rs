use anyhow::Result;
use clap::Parser;
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncBufReadExt;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

#[derive(Parser)]
#[command(name = "client", about = "Line-oriented chat client")]
struct Args {
    #[arg(long, default_value = "ws://127.0.0.1:8080/ws")]
    url: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (ws, _) = connect_async(args.url.as_str()).await?;
    eprintln!("connected to {}", args.url);
    let (mut sink, mut stream) = ws.split();

    // Print everything the hub fans out to us.
    tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => println!("{text}"),
                Ok(Message::Binary(data)) => println!("<{} binary bytes>", data.len()),
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
        eprintln!("server closed the connection");
        std::process::exit(0);
    });

    // Each stdin line becomes one broadcast.
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.is_empty() {
            continue;
        }
        sink.send(Message::text(line)).await?;
    }
    sink.close().await.ok();
    Ok(())
}
