use anyhow::Context;
use chatvault::cache::{DocumentCacheManager, PdfDecoder};
use chatvault::completion::{self, CompletionProvider, StaticReply};
use chatvault::config::{self, Config};
use chatvault::index::DocumentIndex;
use chatvault::remote::{MemoryBlobStore, MemoryDocumentStore, StaticIdentity};
use chatvault::sync::{MessageSyncEngine, PipelinePolicy};
use chatvault::telemetry;
use chatvault::types::Message;
use chatvault::upload::UploadCoordinator;
use std::path::Path;
use std::sync::Arc;
use time::UtcOffset;
use time::format_description::FormatItem;
use time::macros::format_description;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

const MESSAGE_TIME_FORMAT: &[FormatItem<'static>] =
    format_description!("[hour repr:12 padding:zero]:[minute padding:zero] [period case:upper]");

const LOCAL_USER: &str = "local";

const HELP: &str = "\
Type a message to send it, or:
  :attach <path>   import and upload a document
  :docs            list documents
  :find <text>     search documents by name
  :open <name>     load a document through the cache
  :rm <name>       remove a document
  :orphans         reconcile orphaned uploads
  :quit            exit";

fn print_message(message: &Message) {
    let mut timestamp = message.timestamp;
    if let Ok(offset) = UtcOffset::current_local_offset() {
        timestamp = timestamp.to_offset(offset);
    }
    let time = timestamp.format(MESSAGE_TIME_FORMAT).unwrap_or_default();
    let who = if message.is_user { "you" } else { "assistant" };
    println!("[{time}] {who}: {}", message.content);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    config::load_dotenv();
    telemetry::init();
    let config = Config::from_env().context("loading configuration")?;

    let provider: Arc<dyn CompletionProvider> = match completion::from_settings(&config.completion)
    {
        Ok(provider) => provider,
        Err(err) => {
            warn!(error = %err, "no completion provider configured, replies will be canned");
            Arc::new(StaticReply::new(
                "No completion provider is configured. Set COMPLETION_ENDPOINT or an API key.",
            ))
        }
    };

    let store = Arc::new(MemoryDocumentStore::new());
    let blobs = Arc::new(MemoryBlobStore::new());
    let identity = Arc::new(StaticIdentity::signed_in(LOCAL_USER));

    let engine = MessageSyncEngine::new(store.clone(), identity.clone(), provider);
    let uploads = Arc::new(UploadCoordinator::new(
        store.clone(),
        blobs.clone(),
        identity.clone(),
    ));
    let cache = DocumentCacheManager::new(
        &config.cache_dir,
        config.cache_capacity,
        blobs,
        PdfDecoder,
    );
    let index = DocumentIndex::open(
        &config.documents_dir,
        config.document_extensions.clone(),
        store,
        identity,
        uploads.clone(),
        cache,
    )
    .await
    .context("opening document index")?;

    let mut feed = engine.subscribe(LOCAL_USER).await?;
    let printer = tokio::spawn(async move {
        let mut shown = 0;
        while let Ok(messages) = feed.changed().await {
            for message in messages.iter().skip(shown) {
                print_message(message);
            }
            shown = messages.len();
        }
    });

    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let (command, argument) = line.split_once(' ').unwrap_or((line, ""));
        let argument = argument.trim();

        match command {
            "" => {}
            ":quit" => break,
            ":help" => println!("{HELP}"),
            ":attach" => match index.add(Path::new(argument)).await {
                Ok(pending) => {
                    println!("uploading {}...", pending.document().name);
                    match pending.wait().await {
                        Ok(doc) => println!("{} {}", doc.name, doc.status_text()),
                        Err(err) => println!("upload failed: {err}"),
                    }
                }
                Err(err) => println!("could not import {argument}: {err}"),
            },
            ":docs" | ":find" => {
                let documents = index.search(argument);
                if documents.is_empty() {
                    println!("no documents");
                }
                for doc in documents {
                    println!(
                        "{:<32} {:>9}  {}  {}",
                        doc.name,
                        doc.formatted_size(),
                        doc.formatted_date(),
                        doc.status_text()
                    );
                }
            }
            ":open" => match index.get(argument) {
                Some(doc) => match index.content(&doc).await {
                    Ok(pdf) => println!(
                        "{}: PDF {} ({} bytes)",
                        doc.name,
                        pdf.version,
                        pdf.bytes.len()
                    ),
                    Err(err) => println!("could not open {}: {err}", doc.name),
                },
                None => println!("no document named {argument}"),
            },
            ":rm" => match index.get(argument) {
                Some(doc) => match index.remove(&doc).await {
                    Ok(()) => println!("removed {}", doc.name),
                    Err(err) => println!("could not remove {}: {err}", doc.name),
                },
                None => println!("no document named {argument}"),
            },
            ":orphans" => match uploads.reconcile_orphans().await {
                Ok(report) => println!(
                    "adopted {}, deleted {}, remaining {}",
                    report.adopted, report.deleted, report.remaining
                ),
                Err(err) => println!("reconcile failed: {err}"),
            },
            _ => match engine.send(line).await {
                Ok(reply) => {
                    if let Err(err) = reply.wait().await {
                        println!("no reply: {err}");
                    }
                }
                Err(err) => println!("not sent: {err}"),
            },
        }
    }

    engine.shutdown(PipelinePolicy::Await).await;
    printer.abort();
    Ok(())
}
