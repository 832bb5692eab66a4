use std::fs::{self, File, OpenOptions};
use std::marker::PhantomData;
use std::path::Path;

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::Result;
use crate::types::{ChainTradeRow, Trade};

/// A record type with a fixed column order.
pub trait CsvRow: Serialize {
    const HEADERS: &'static [&'static str];
}

impl CsvRow for Trade {
    const HEADERS: &'static [&'static str] = &[
        "market_slug",
        "window_start_ts",
        "condition_id",
        "event_id",
        "trade_timestamp",
        "trade_utc",
        "price",
        "size",
        "notional",
        "side",
        "outcome",
        "asset",
        "proxy_wallet",
        "transaction_hash",
        "dedupe_key",
        "timestamp_ms",
        "server_received_ms",
        "trade_time_ms",
    ];
}

impl CsvRow for ChainTradeRow {
    const HEADERS: &'static [&'static str] = &[
        "market_slug",
        "condition_id",
        "tx_hash",
        "log_index",
        "log_uid",
        "block_number",
        "trade_timestamp",
        "trade_utc",
        "proxy_wallet",
        "side",
        "outcome",
        "asset",
        "size",
        "price",
        "notional",
        "fee",
        "maker_asset_id",
        "taker_asset_id",
        "maker_amount_raw",
        "taker_amount_raw",
        "fee_raw",
    ];
}

/// Append-only CSV file. The header goes in only when the file is new or empty; every
/// append is serialized by the lock and flushed.
pub struct CsvSink<T> {
    writer: Mutex<csv::Writer<File>>,
    _row: PhantomData<fn(&T)>,
}

impl<T: CsvRow> CsvSink<T> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let is_new = fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if is_new {
            writer.write_record(T::HEADERS)?;
            writer.flush()?;
        }
        Ok(Self {
            writer: Mutex::new(writer),
            _row: PhantomData,
        })
    }

    pub fn append(&self, row: &T) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.serialize(row)?;
        writer.flush()?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.writer.lock().flush()?;
        Ok(())
    }
}

/// Writes `rows` to a fresh file (truncating), header first.
pub fn write_rows<T: CsvRow>(path: impl AsRef<Path>, rows: &[T]) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_path(path)?;
    writer.write_record(T::HEADERS)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;

    fn trade(tx: &str, price: Option<f64>) -> Trade {
        Trade {
            market_slug: "btc-updown-5m-1771211700".into(),
            window_start_ts: 1771211700,
            condition_id: "0xcond".into(),
            event_id: "ev".into(),
            trade_timestamp: 1771211800,
            trade_utc: "2026-02-16T03:16:40Z".into(),
            price,
            size: 5.0,
            notional: price.map(|p| p * 5.0),
            side: Side::Sell,
            outcome: "Up".into(),
            asset: "77".into(),
            proxy_wallet: "0xmaker".into(),
            transaction_hash: tx.into(),
            dedupe_key: format!("{tx}|77|SELL"),
            timestamp_ms: Some(1771211800004),
            server_received_ms: None,
            trade_time_ms: Some("2026-02-16T03:16:40.004Z".into()),
        }
    }

    fn read_lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path).unwrap().lines().map(str::to_string).collect()
    }

    #[test]
    fn header_once_across_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("trades.csv");

        let sink = CsvSink::<Trade>::open(&path).unwrap();
        sink.append(&trade("0xa", Some(0.5))).unwrap();
        drop(sink);

        let sink = CsvSink::<Trade>::open(&path).unwrap();
        sink.append(&trade("0xb", None)).unwrap();

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], Trade::HEADERS.join(","));
        assert!(lines[1].contains(",0.5,5.0,2.5,SELL,"));
        // absent price and notional are empty columns
        assert!(lines[2].contains(",,5.0,,SELL,"));
    }

    #[test]
    fn empty_existing_file_gets_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trades.csv");
        File::create(&path).unwrap();
        let sink = CsvSink::<Trade>::open(&path).unwrap();
        sink.flush().unwrap();
        assert_eq!(read_lines(&path), vec![Trade::HEADERS.join(",")]);
    }

    #[test]
    fn batch_write_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        write_rows(&path, &[trade("0xa", Some(0.5)), trade("0xb", Some(0.4))]).unwrap();
        write_rows(&path, &[trade("0xc", Some(0.5))]).unwrap();
        let lines = read_lines(&path);
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("0xc"));
    }
}
