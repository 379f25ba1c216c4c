//! Plain HTML message rendering for chat sinks.

use crate::notify::VaultEvent;
use crate::vault::VaultRecord;
use alloy::primitives::U256;
use chrono::{DateTime, Utc};

/// Format a raw token amount with the vault's deposit-token precision when known.
pub fn fmt_amount(value: U256, decimals: Option<u8>) -> String {
    let Some(d) = decimals.filter(|d| *d > 0 && *d <= 77) else {
        return value.to_string();
    };
    let unit = U256::from(10u8).pow(U256::from(d));
    let whole = value / unit;
    let frac = value % unit;
    if frac.is_zero() {
        return whole.to_string();
    }
    let frac = format!("{:0>width$}", frac.to_string(), width = d as usize);
    format!("{}.{}", whole, frac.trim_end_matches('0'))
}

/// Maturity as a UTC date, falling back to the raw integer.
pub fn fmt_maturity(maturity: U256) -> String {
    u64::try_from(maturity)
        .ok()
        .and_then(|t| i64::try_from(t).ok())
        .and_then(|t| DateTime::<Utc>::from_timestamp(t, 0))
        .map(|d| d.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| format!("ts={}", maturity))
}

fn token(record: &VaultRecord) -> &str {
    record.deposit_token_symbol.as_deref().unwrap_or("")
}

fn header(record: &VaultRecord) -> String {
    format!(
        "<b>{}</b> ({})\n<code>{}</code>",
        escape(&record.name),
        escape(&record.symbol),
        record.address
    )
}

fn capacity_lines(record: &VaultRecord) -> String {
    let decimals = record.deposit_token_decimals;
    format!(
        "<b>Deposited:</b> {} / {} {}\n<b>Utilization:</b> {:.2}%\n<b>Maturity:</b> {}",
        fmt_amount(record.last_known_total_supply, decimals),
        fmt_amount(record.total_supply_cap, decimals),
        token(record),
        record.utilization_pct(),
        fmt_maturity(record.maturity)
    )
}

/// Render an event as Telegram-flavoured HTML.
pub fn render(event: &VaultEvent) -> String {
    match event {
        VaultEvent::Startup { vaults, last_block } => format!(
            "🟢 <b>Vault monitor online</b>\nTracking {} vaults from block {}",
            vaults, last_block
        ),
        VaultEvent::VaultCreated { record, filled } => format!(
            "🆕 <b>New vault</b>{}\n{}\n{}",
            if *filled { " (already full)" } else { "" },
            header(record),
            capacity_lines(record)
        ),
        VaultEvent::CapRaised {
            record,
            old_cap,
            new_cap,
            current_supply,
        } => {
            let decimals = record.deposit_token_decimals;
            format!(
                "📈 <b>Cap raised</b>\n{}\n<b>Cap:</b> {} → {} {}\n<b>Deposited:</b> {}\n<b>Utilization:</b> {:.2}%",
                header(record),
                fmt_amount(*old_cap, decimals),
                fmt_amount(*new_cap, decimals),
                token(record),
                fmt_amount(*current_supply, decimals),
                record.utilization_pct()
            )
        }
        VaultEvent::VaultFilled { record } => {
            format!("🔒 <b>Vault filled</b>\n{}\n{}", header(record), capacity_lines(record))
        }
        VaultEvent::VaultAvailable { record } => format!(
            "✅ <b>Capacity available</b>\n{}\n{}",
            header(record),
            capacity_lines(record)
        ),
    }
}

/// Minimal escaping for Telegram HTML parse mode.
pub fn escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}
