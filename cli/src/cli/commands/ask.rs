use std::io::Write;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose, Engine as _};
use futures::StreamExt;
use nutrik_core::config::Config;
use nutrik_core::proxy::{ChatInput, ChatService};

pub async fn run(config: Config, message: String, image: Option<PathBuf>, stream: bool) -> anyhow::Result<()> {
    let image = match image {
        Some(path) => Some(image_data_uri(&path)?),
        None => None,
    };

    let service = ChatService::from_config(&config)?;
    let input = ChatInput {
        message: Some(message),
        image,
        history: Vec::new(),
    };

    if !stream {
        let reply = service.reply("cli", input).await?;
        println!("{}", reply);
        return Ok(());
    }

    let mut fragments = service.reply_stream("cli", input).await?;
    let mut stdout = std::io::stdout();
    while let Some(fragment) = fragments.next().await {
        match fragment {
            Ok(text) => {
                write!(stdout, "{}", text)?;
                stdout.flush()?;
            }
            Err(e) => anyhow::bail!(e),
        }
    }
    writeln!(stdout)?;

    Ok(())
}

fn image_data_uri(path: &Path) -> anyhow::Result<String> {
    let bytes = std::fs::read(path)?;
    let mime = mime_for_extension(path)
        .ok_or_else(|| anyhow::anyhow!("Unsupported image type: {:?}", path))?;
    Ok(format!("data:{};base64,{}", mime, general_purpose::STANDARD.encode(bytes)))
}

fn mime_for_extension(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "heic" => Some("image/heic"),
        _ => None,
    }
}
