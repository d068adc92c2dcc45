//! Line-delimited stdio transport. One JSON object per input line, one
//! response object per line of stdout. Blank lines are ignored; responses
//! are emitted in completion order, not arrival order, so a slow
//! in-flight call never blocks faster ones queued behind it on the same
//! connection: each request is spawned onto its own task and writes are
//! serialised on an mpsc channel into a single writer task.

use crate::host::Host;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

pub async fn run(host: Arc<Host>) -> std::io::Result<()> {
	let stdin = tokio::io::stdin();
	let mut lines = BufReader::new(stdin).lines();
	let (tx, mut rx) = mpsc::channel::<String>(256);

	let writer_task = tokio::spawn(async move {
		let mut stdout = tokio::io::stdout();
		while let Some(line) = rx.recv().await {
			if stdout.write_all(line.as_bytes()).await.is_err() {
				break;
			}
			if stdout.write_all(b"\n").await.is_err() {
				break;
			}
			let _ = stdout.flush().await;
		}
	});

	let mut in_flight = tokio::task::JoinSet::new();
	while let Some(line) = lines.next_line().await? {
		if line.trim().is_empty() {
			continue;
		}
		let host = host.clone();
		let tx = tx.clone();
		in_flight.spawn(async move {
			if let Some(response) = crate::rpc::dispatch(&host, &line).await {
				if let Ok(serialized) = serde_json::to_string(&response) {
					let _ = tx.send(serialized).await;
				}
			}
		});
	}

	while in_flight.join_next().await.is_some() {}
	drop(tx);
	let _ = writer_task.await;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn blank_lines_are_distinguishable_from_requests() {
		assert!("".trim().is_empty());
		assert!("   ".trim().is_empty());
		assert!(!"{}".trim().is_empty());
	}
}
