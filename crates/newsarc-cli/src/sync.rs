use std::time::Duration;

use anyhow::Result;
use tracing::{debug, error, info};

use newsarc_core::{ArchiveStore, StoreOutcome};
use newsarc_nntp::{
    ArticleSource, EventAction, EventTarget, Fetcher, StatusSink, SyncEvent,
};

/// Courtesy pause while scanning a shared upstream server.
pub(crate) const SCAN_COOLDOWN_EVERY: u64 = 1000;
pub(crate) const SCAN_COOLDOWN: Duration = Duration::from_secs(30);

/// Identity used before a fresh-mode article has been downloaded.
pub(crate) const PLACEHOLDER_MESSAGE_ID: &str = "unknown msg-id";

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SyncOptions {
    pub(crate) aggressive: bool,
    pub(crate) dry_run: bool,
    pub(crate) keep_going: bool,
    pub(crate) update: bool,
    pub(crate) start: Option<u64>,
    pub(crate) count: Option<u64>,
}

#[derive(Debug)]
pub(crate) struct DownloadReport {
    pub(crate) range: (u64, u64),
    pub(crate) scanned: Vec<u64>,
    pub(crate) processed: Vec<u64>,
    pub(crate) stored: u64,
    pub(crate) linked: u64,
    pub(crate) skipped: u64,
    pub(crate) failed: u64,
}

impl DownloadReport {
    fn new(startnr: u64, last: u64) -> Self {
        Self {
            range: (startnr, last),
            scanned: Vec::new(),
            processed: Vec::new(),
            stored: 0,
            linked: 0,
            skipped: 0,
            failed: 0,
        }
    }
}

/// Computes the inclusive article-number interval to examine.
pub(crate) fn plan_range(
    first: u64,
    last: u64,
    start: Option<u64>,
    count: Option<u64>,
) -> (u64, u64) {
    if first > last {
        return (first, last);
    }
    match start {
        Some(start) => {
            let startnr = start.clamp(first, last);
            let last = match count {
                Some(count) => last.min(startnr.saturating_add(count)),
                None => last,
            };
            (startnr, last)
        }
        None => {
            let startnr = match count {
                Some(count) => first.max(last.saturating_sub(count)),
                None => first,
            };
            (startnr, last)
        }
    }
}

pub(crate) async fn run_sync<S: ArticleSource + Send>(
    store: &ArchiveStore,
    mut fetcher: Fetcher<S>,
    groups: &[String],
    options: SyncOptions,
    sink: &dyn StatusSink,
) -> Result<()> {
    for group in groups {
        match download(store, &mut fetcher, group, options, sink).await {
            Ok(report) => info!(
                "{group}: scanned {} of {}..={}, retrieved {}, stored {}, linked {}, skipped {}, failed {}",
                report.scanned.len(),
                report.range.0,
                report.range.1,
                report.processed.len(),
                report.stored,
                report.linked,
                report.skipped,
                report.failed
            ),
            Err(err) => error!("sync of {group} failed: {err:#}"),
        }
    }
    let _ = fetcher.into_source().quit().await;
    Ok(())
}

pub(crate) async fn resolve_pass(store: &ArchiveStore) -> Result<()> {
    let replies = store.resolve_in_reply_to().await?;
    let references = store.resolve_references().await?;
    if replies > 0 || references > 0 {
        info!("resolved {replies} reply links and {references} references");
    }
    Ok(())
}

pub(crate) async fn download<S: ArticleSource + Send>(
    store: &ArchiveStore,
    fetcher: &mut Fetcher<S>,
    group: &str,
    options: SyncOptions,
    sink: &dyn StatusSink,
) -> Result<DownloadReport> {
    let list_id = if options.dry_run {
        None
    } else {
        Some(store.feed_id(group).await?)
    };

    let status = fetcher.source_mut().group(group).await?;
    info!(
        "group {} has {} articles, range {} to {}",
        status.name, status.count, status.first, status.last
    );

    let (startnr, last) = plan_range(status.first, status.last, options.start, options.count);
    if options.start.is_none() {
        info!("no start message provided, starting at {startnr}");
    }
    info!("checking messages {startnr} to {last}");

    let mut report = DownloadReport::new(startnr, last);
    let mut stack: Vec<u64> = Vec::new();
    let span = last.saturating_sub(startnr).max(1);

    // Newest first, so a known article ends the scan as early as possible.
    for msgno in (startnr..=last).rev() {
        if !options.aggressive && msgno % SCAN_COOLDOWN_EVERY == 0 && msgno != startnr {
            info!("{msgno}: sleeping {} seconds", SCAN_COOLDOWN.as_secs());
            tokio::time::sleep(SCAN_COOLDOWN).await;
        }

        report.scanned.push(msgno);
        let Some(list_id) = list_id else {
            info!("dry run: would check message no. {msgno}");
            continue;
        };
        sink.progress((100 * (last - msgno) / span) as u8);

        match check(store, fetcher, list_id, msgno, options.update, sink).await {
            Ok(true) => stack.push(msgno),
            Ok(false) => {
                info!("found a message that is already in the mbox");
                break;
            }
            Err(err) => {
                error!("check of article {msgno} failed: {err:#}");
                if !options.keep_going {
                    return Err(err);
                }
                report.failed += 1;
            }
        }
    }

    let Some(list_id) = list_id else {
        return Ok(report);
    };

    let total = stack.len() as u64;
    info!("retrieving {total} messages");

    // Popping from the back turns the newest-first scan into an oldest-first
    // store order, so parents tend to exist before their replies.
    let mut count = 0u64;
    let mut failcount = 0u64;
    while let Some(msgno) = stack.pop() {
        count += 1;
        sink.progress((100 * count / total.max(1)) as u8);
        report.processed.push(msgno);

        match fetch_and_store(store, fetcher, list_id, msgno, sink).await {
            Ok(StoreOutcome::Stored) => report.stored += 1,
            Ok(StoreOutcome::Linked) => report.linked += 1,
            Ok(StoreOutcome::Skipped) => report.skipped += 1,
            Err(err) => {
                failcount += 1;
                error!("retrieval of article {msgno} failed: {err:#}");
                if !options.keep_going {
                    return Err(err);
                }
            }
        }
    }

    report.failed += failcount;
    if failcount > 0 {
        info!(
            "{failcount} messages ({}%) could not be imported due to defects",
            100 * failcount / count.max(1)
        );
    }
    Ok(report)
}

async fn check<S: ArticleSource + Send>(
    store: &ArchiveStore,
    fetcher: &mut Fetcher<S>,
    list_id: i64,
    msgno: u64,
    update: bool,
    sink: &dyn StatusSink,
) -> Result<bool> {
    let (number, message_id) = if update {
        let stat = fetcher.stat(msgno).await?;
        (stat.number, stat.message_id)
    } else {
        // Fresh syncs always fetch; identity is only known after the download.
        (msgno, PLACEHOLDER_MESSAGE_ID.to_string())
    };

    let queue = !update || store.contains(list_id, &message_id).await?.is_none();
    sink.event(&SyncEvent {
        target: EventTarget::Db,
        action: if queue {
            EventAction::Queue
        } else {
            EventAction::Skip
        },
        number,
        requested: msgno,
        message_id,
    });
    Ok(queue)
}

async fn fetch_and_store<S: ArticleSource + Send>(
    store: &ArchiveStore,
    fetcher: &mut Fetcher<S>,
    list_id: i64,
    msgno: u64,
    sink: &dyn StatusSink,
) -> Result<StoreOutcome> {
    let article = fetcher.get(msgno).await?;
    sink.event(&SyncEvent {
        target: EventTarget::Mbox,
        action: EventAction::Store,
        number: article.number,
        requested: msgno,
        message_id: article.message_id.clone(),
    });

    match store
        .store_article(list_id, &article.message_id, &article.lines)
        .await
    {
        Ok(outcome) => Ok(outcome),
        Err(err) => {
            sink.event(&SyncEvent {
                target: EventTarget::Mbox,
                action: EventAction::Fail,
                number: article.number,
                requested: msgno,
                message_id: article.message_id.clone(),
            });
            // Keep the raw content around for forensic replay.
            let rule = "-".repeat(80);
            let dump = article
                .lines
                .iter()
                .map(|line| String::from_utf8_lossy(line))
                .collect::<Vec<_>>()
                .join("\n");
            debug!("message:\n{rule}\n{dump}\n{rule}");
            Err(err.into())
        }
    }
}
