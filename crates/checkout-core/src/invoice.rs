//! # Invoice Rendering
//!
//! Renders an order as a PDF invoice and delivers it to two sinks at once:
//! a durable file and a live byte stream (usually an HTTP response).
//!
//! ```text
//!                       ┌──► channel ──► durable task ──► invoice-<id>.pdf
//!   render ──► producer ┤
//!                       └──► channel ──► live task ─────► response body
//! ```
//!
//! A sink that fails drops out; the producer keeps feeding the other one.
//! The file is written under a temporary name and renamed into place only
//! after the final chunk, so a failed delivery never leaves a truncated
//! invoice behind.

use crate::error::{ShopError, ShopResult};
use crate::ids::{Identity, OrderId};
use crate::order::{Order, SharedOrderStore};
use crate::pdf::{PdfWriter, PAGE_HEIGHT};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Size of each chunk handed to the sinks
pub const INVOICE_CHUNK_SIZE: usize = 4 * 1024;

/// Chunks buffered per sink before the producer waits
pub const SINK_CHANNEL_CAPACITY: usize = 8;

const MARGIN: i32 = 72;
const LINE_HEIGHT: i32 = 20;
const SEPARATOR: &str = "----------------------";

/// File name for an order's invoice
pub fn invoice_file_name(order_id: &OrderId) -> String {
    format!("invoice-{}.pdf", order_id)
}

/// Render an order into PDF bytes. The total is recomputed from the lines.
pub fn render_invoice(order: &Order) -> ShopResult<Vec<u8>> {
    let total = order.total()?;
    let mut pdf = PdfWriter::new();
    let mut y = PAGE_HEIGHT - MARGIN;

    pdf.text(MARGIN, y, 26, "Invoice");
    pdf.line(MARGIN, y - 6, MARGIN + 100, y - 6);
    y -= 2 * LINE_HEIGHT;

    for header in [
        format!("Order: {}", order.id),
        format!("Order date: {}", order.created_at.format("%Y-%m-%d")),
        format!("Billed to: {}", order.user.email),
    ] {
        pdf.text(MARGIN, y, 12, &header);
        y -= LINE_HEIGHT;
    }
    pdf.text(MARGIN, y, 12, SEPARATOR);
    y -= LINE_HEIGHT;

    for line in &order.lines {
        if y < MARGIN + LINE_HEIGHT {
            pdf.new_page();
            y = PAGE_HEIGHT - MARGIN;
        }
        let text = format!("{} - x{} {}", line.title, line.quantity, line.unit_price.display());
        pdf.text(MARGIN, y, 12, &text);
        y -= LINE_HEIGHT;
    }

    if y < MARGIN + 2 * LINE_HEIGHT {
        pdf.new_page();
        y = PAGE_HEIGHT - MARGIN;
    }
    pdf.text(MARGIN, y, 12, SEPARATOR);
    y -= LINE_HEIGHT;
    pdf.text(MARGIN, y, 14, &format!("Total Price: {}", total.display()));

    Ok(pdf.finish())
}

// =============================================================================
// Sinks
// =============================================================================

/// Destination for invoice bytes
#[async_trait]
pub trait InvoiceSink: Send {
    /// Short name used in logs and reports
    fn name(&self) -> &'static str;

    async fn write(&mut self, chunk: &[u8]) -> io::Result<()>;

    /// Called once after the last chunk
    async fn finish(&mut self) -> io::Result<()>;

    /// Called instead of `finish` when a write failed
    async fn abort(&mut self) {}
}

/// Writes to `<dir>/invoice-<id>.pdf` via a temporary file
pub struct FileSink {
    path: PathBuf,
    partial: PathBuf,
    file: Option<File>,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut partial = path.clone().into_os_string();
        partial.push(".part");
        Self {
            path,
            partial: PathBuf::from(partial),
            file: None,
        }
    }

    /// Sink for an order's invoice inside `dir`
    pub fn for_order(dir: &Path, order_id: &OrderId) -> Self {
        Self::new(dir.join(invoice_file_name(order_id)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl InvoiceSink for FileSink {
    fn name(&self) -> &'static str {
        "durable"
    }

    async fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        if self.file.is_none() {
            if let Some(parent) = self.partial.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            self.file = Some(File::create(&self.partial).await?);
        }
        match self.file.as_mut() {
            Some(file) => file.write_all(chunk).await,
            None => Err(io::Error::new(io::ErrorKind::Other, "invoice file not open")),
        }
    }

    async fn finish(&mut self) -> io::Result<()> {
        let Some(mut file) = self.file.take() else {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "no invoice bytes written"));
        };
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&self.partial, &self.path).await
    }

    async fn abort(&mut self) {
        self.file = None;
        if let Err(e) = tokio::fs::remove_file(&self.partial).await {
            debug!("Could not remove {}: {}", self.partial.display(), e);
        }
    }
}

/// Forwards chunks into a channel, e.g. an HTTP response body
pub struct ChannelSink {
    tx: mpsc::Sender<Bytes>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl InvoiceSink for ChannelSink {
    fn name(&self) -> &'static str {
        "live"
    }

    async fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.tx
            .send(Bytes::copy_from_slice(chunk))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "live consumer went away"))
    }

    async fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// =============================================================================
// Delivery
// =============================================================================

/// What happened to one sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SinkOutcome {
    Delivered { bytes: u64 },
    Failed { bytes: u64, error: String },
}

impl SinkOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, SinkOutcome::Delivered { .. })
    }
}

/// Per-sink result of one delivery
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryReport {
    pub durable: SinkOutcome,
    pub live: SinkOutcome,
}

/// Write `document` to both sinks concurrently.
///
/// Each sink is drained by its own task. A sink failure is reported, never
/// propagated to the other sink.
pub async fn deliver<D, L>(document: Bytes, durable: D, live: L) -> DeliveryReport
where
    D: InvoiceSink + 'static,
    L: InvoiceSink + 'static,
{
    let (durable_tx, durable_rx) = mpsc::channel(SINK_CHANNEL_CAPACITY);
    let (live_tx, live_rx) = mpsc::channel(SINK_CHANNEL_CAPACITY);

    let durable_task = tokio::spawn(drain(durable_rx, durable));
    let live_task = tokio::spawn(drain(live_rx, live));

    let mut targets = [Some(durable_tx), Some(live_tx)];
    let mut offset = 0;
    while offset < document.len() && targets.iter().any(Option::is_some) {
        let end = (offset + INVOICE_CHUNK_SIZE).min(document.len());
        let chunk = document.slice(offset..end);
        for target in targets.iter_mut() {
            if let Some(tx) = target {
                if tx.send(chunk.clone()).await.is_err() {
                    // Consumer gave up; stop feeding it.
                    *target = None;
                }
            }
        }
        offset = end;
    }
    drop(targets);

    let report = DeliveryReport {
        durable: joined(durable_task).await,
        live: joined(live_task).await,
    };

    match (&report.durable, &report.live) {
        (SinkOutcome::Delivered { bytes }, SinkOutcome::Delivered { .. }) => {
            info!("Invoice delivered ({} bytes)", bytes)
        }
        _ => warn!("Invoice delivery incomplete: {:?}", report),
    }
    report
}

async fn drain<S: InvoiceSink>(mut rx: mpsc::Receiver<Bytes>, mut sink: S) -> SinkOutcome {
    let mut written = 0u64;
    while let Some(chunk) = rx.recv().await {
        if let Err(e) = sink.write(&chunk).await {
            warn!(sink = sink.name(), "Invoice sink failed after {} bytes: {}", written, e);
            rx.close();
            sink.abort().await;
            return SinkOutcome::Failed {
                bytes: written,
                error: e.to_string(),
            };
        }
        written += chunk.len() as u64;
    }

    match sink.finish().await {
        Ok(()) => SinkOutcome::Delivered { bytes: written },
        Err(e) => {
            warn!(sink = sink.name(), "Invoice sink failed to finish: {}", e);
            sink.abort().await;
            SinkOutcome::Failed {
                bytes: written,
                error: e.to_string(),
            }
        }
    }
}

async fn joined(task: JoinHandle<SinkOutcome>) -> SinkOutcome {
    task.await.unwrap_or_else(|e| SinkOutcome::Failed {
        bytes: 0,
        error: format!("sink task aborted: {}", e),
    })
}

// =============================================================================
// Renderer
// =============================================================================

/// A live invoice being streamed while it is also written to disk
pub struct InvoiceStream {
    pub file_name: String,
    pub content_length: usize,
    pub chunks: mpsc::Receiver<Bytes>,
    pub delivery: JoinHandle<DeliveryReport>,
}

/// Loads orders, checks ownership and renders invoices
#[derive(Clone)]
pub struct InvoiceRenderer {
    orders: SharedOrderStore,
    invoice_dir: PathBuf,
}

impl InvoiceRenderer {
    pub fn new(orders: SharedOrderStore, invoice_dir: impl Into<PathBuf>) -> Self {
        Self {
            orders,
            invoice_dir: invoice_dir.into(),
        }
    }

    pub fn invoice_path(&self, order_id: &OrderId) -> PathBuf {
        self.invoice_dir.join(invoice_file_name(order_id))
    }

    /// Load an order the requester is allowed to see
    #[instrument(skip(self, requester), fields(user_id = %requester.user_id))]
    pub async fn load_for(&self, order_id: &OrderId, requester: &Identity) -> ShopResult<Order> {
        let order = self
            .orders
            .find_by_id(order_id)
            .await?
            .ok_or_else(|| ShopError::order_not_found(order_id.as_str()))?;

        if !order.is_owned_by(&requester.user_id) {
            warn!("User {} requested invoice for order {} they do not own", requester.user_id, order_id);
            return Err(ShopError::Unauthorized { entity: "order" });
        }
        Ok(order)
    }

    /// Render the invoice bytes for an order the requester owns
    pub async fn render(&self, order_id: &OrderId, requester: &Identity) -> ShopResult<Bytes> {
        let order = self.load_for(order_id, requester).await?;
        Ok(Bytes::from(render_invoice(&order)?))
    }

    /// Render and deliver to the invoice file and `live`, waiting for both
    pub async fn deliver_to<L>(&self, order_id: &OrderId, requester: &Identity, live: L) -> ShopResult<DeliveryReport>
    where
        L: InvoiceSink + 'static,
    {
        let document = self.render(order_id, requester).await?;
        let durable = FileSink::for_order(&self.invoice_dir, order_id);
        Ok(deliver(document, durable, live).await)
    }

    /// Render and start streaming. Authorization and rendering errors are
    /// returned before any byte is sent.
    pub async fn open_stream(&self, order_id: &OrderId, requester: &Identity) -> ShopResult<InvoiceStream> {
        let document = self.render(order_id, requester).await?;
        let (tx, rx) = mpsc::channel(SINK_CHANNEL_CAPACITY);
        let content_length = document.len();
        let durable = FileSink::for_order(&self.invoice_dir, order_id);

        let delivery = tokio::spawn(deliver(document, durable, ChannelSink::new(tx)));

        Ok(InvoiceStream {
            file_name: invoice_file_name(order_id),
            content_length,
            chunks: rx,
            delivery,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{ProductId, UserId};
    use crate::order::{InMemoryOrderStore, OrderLine, OrderStore, OrderUser, PaymentState};
    use crate::product::{Currency, Price};
    use chrono::TimeZone;
    use std::sync::{Arc, Mutex};

    fn widget_order() -> Order {
        Order {
            id: OrderId::new("ord-1"),
            user: OrderUser {
                id: UserId::new("alice"),
                email: "alice@example.com".to_string(),
            },
            lines: vec![OrderLine {
                product_id: ProductId::new("widget"),
                title: "Widget".to_string(),
                description: "A widget".to_string(),
                unit_price: Price::parse("9.99", Currency::USD).unwrap(),
                quantity: 3,
            }],
            currency: Currency::USD,
            payment: PaymentState::Paid {
                reference: "ch_1".to_string(),
            },
            created_at: chrono::Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        }
    }

    async fn renderer(dir: &Path) -> (InvoiceRenderer, Identity) {
        let store = Arc::new(InMemoryOrderStore::new());
        store.save(widget_order()).await.unwrap();
        (
            InvoiceRenderer::new(store, dir),
            Identity::new("alice", "alice@example.com"),
        )
    }

    /// Collects everything written to it
    #[derive(Clone, Default)]
    struct MemorySink {
        bytes: Arc<Mutex<Vec<u8>>>,
    }

    #[async_trait]
    impl InvoiceSink for MemorySink {
        fn name(&self) -> &'static str {
            "memory"
        }

        async fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
            self.bytes.lock().unwrap().extend_from_slice(chunk);
            Ok(())
        }

        async fn finish(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Fails on the first write
    struct BrokenSink;

    #[async_trait]
    impl InvoiceSink for BrokenSink {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn write(&mut self, _chunk: &[u8]) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }

        async fn finish(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn text(bytes: &[u8]) -> String {
        String::from_utf8_lossy(bytes).into_owned()
    }

    #[test]
    fn test_invoice_content() {
        let text = text(&render_invoice(&widget_order()).unwrap());

        assert!(text.contains("(Invoice) Tj"));
        assert!(text.contains("(Order: ord-1) Tj"));
        assert!(text.contains("(Order date: 2024-05-01) Tj"));
        assert!(text.contains("(Billed to: alice@example.com) Tj"));
        assert!(text.contains("(Widget - x3 $9.99) Tj"));
        assert!(text.contains("(Total Price: $29.97) Tj"));
    }

    #[test]
    fn test_rendering_is_byte_identical() {
        let order = widget_order();
        assert_eq!(render_invoice(&order).unwrap(), render_invoice(&order).unwrap());
    }

    #[test]
    fn test_long_orders_span_pages() {
        let mut order = widget_order();
        let line = order.lines[0].clone();
        order.lines = (0..80).map(|_| line.clone()).collect();

        let text = text(&render_invoice(&order).unwrap());
        assert!(!text.contains("/Count 1 "));
        assert!(text.contains("(Total Price: $2397.60) Tj"));
    }

    #[tokio::test]
    async fn test_unauthorized_is_distinct_from_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (renderer, _) = renderer(dir.path()).await;
        let bob = Identity::new("bob", "bob@example.com");

        let err = renderer.render(&OrderId::new("ord-1"), &bob).await.unwrap_err();
        assert!(matches!(err, ShopError::Unauthorized { .. }));
        assert!(!err.public_message().contains("ord-1"));

        let err = renderer.render(&OrderId::new("missing"), &bob).await.unwrap_err();
        assert!(matches!(err, ShopError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_delivers_to_file_and_live_sink() {
        let dir = tempfile::tempdir().unwrap();
        let (renderer, alice) = renderer(dir.path()).await;
        let live = MemorySink::default();

        let report = renderer
            .deliver_to(&OrderId::new("ord-1"), &alice, live.clone())
            .await
            .unwrap();

        assert!(report.durable.is_delivered());
        assert!(report.live.is_delivered());

        let on_disk = tokio::fs::read(dir.path().join("invoice-ord-1.pdf")).await.unwrap();
        let streamed = live.bytes.lock().unwrap().clone();
        assert_eq!(on_disk, streamed);
        assert!(text(&on_disk).ends_with("%%EOF\n"));
        assert!(!dir.path().join("invoice-ord-1.pdf.part").exists());
    }

    #[tokio::test]
    async fn test_durable_failure_does_not_truncate_live_stream() {
        let document = Bytes::from(render_invoice(&widget_order()).unwrap());
        // Larger than one chunk so the failure happens mid-stream.
        let mut padded = document.to_vec();
        padded.splice(0..0, vec![b'%'; INVOICE_CHUNK_SIZE * 3]);
        let padded = Bytes::from(padded);

        let live = MemorySink::default();
        let report = deliver(padded.clone(), BrokenSink, live.clone()).await;

        assert!(!report.durable.is_delivered());
        assert_eq!(report.live, SinkOutcome::Delivered { bytes: padded.len() as u64 });
        let streamed = live.bytes.lock().unwrap().clone();
        assert_eq!(streamed, padded.to_vec());
        assert!(text(&streamed).ends_with("%%EOF\n"));
    }

    #[tokio::test]
    async fn test_live_disconnect_still_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("invoice-x.pdf");
        let document = Bytes::from(render_invoice(&widget_order()).unwrap());

        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let report = deliver(document.clone(), FileSink::new(&path), ChannelSink::new(tx)).await;

        assert!(report.durable.is_delivered());
        assert!(!report.live.is_delivered());
        assert_eq!(tokio::fs::read(&path).await.unwrap(), document.to_vec());
    }

    #[tokio::test]
    async fn test_open_stream_yields_whole_document() {
        let dir = tempfile::tempdir().unwrap();
        let (renderer, alice) = renderer(dir.path()).await;

        let mut stream = renderer.open_stream(&OrderId::new("ord-1"), &alice).await.unwrap();
        assert_eq!(stream.file_name, "invoice-ord-1.pdf");

        let mut received = Vec::new();
        while let Some(chunk) = stream.chunks.recv().await {
            received.extend_from_slice(&chunk);
        }
        assert_eq!(received.len(), stream.content_length);

        let report = stream.delivery.await.unwrap();
        assert!(report.durable.is_delivered());
        assert!(report.live.is_delivered());
        assert!(renderer.invoice_path(&OrderId::new("ord-1")).exists());
    }
}
