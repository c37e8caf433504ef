use crate::core::TransactionSummary;

use super::NotifyError;
use super::price::PriceFeed;

pub const DEFAULT_TEMPLATE: &str = "🐳 {amount} #{symbol} ({fiat_amount} {fiat_symbol}) moved in block {block_height} for a fee of {fiat_fee} {fiat_symbol}\n{tx_link}";

/// Smallest fiat fee shown, so tiny fees don't render as zero.
const MIN_FIAT_FEE: f64 = 0.0001;

/// Builds the public message for a notable transaction.
pub struct MessageComposer {
    template: String,
    symbol: String,
    block_explorer: String,
    fiat_symbol: String,
    price: Option<PriceFeed>,
}

impl MessageComposer {
    pub fn new(
        template: impl Into<String>,
        symbol: impl Into<String>,
        block_explorer: impl Into<String>,
        fiat_symbol: impl Into<String>,
        price: Option<PriceFeed>,
    ) -> Self {
        Self {
            template: template.into(),
            symbol: symbol.into(),
            block_explorer: block_explorer.into(),
            fiat_symbol: fiat_symbol.into(),
            price,
        }
    }

    /// Fetch the current fiat rate (if a feed is configured) and render.
    pub async fn compose(&self, tx: &TransactionSummary) -> Result<String, NotifyError> {
        let rate = match &self.price {
            Some(feed) => Some(feed.fetch().await?),
            None => None,
        };
        Ok(self.render(tx, rate))
    }

    pub fn render(&self, tx: &TransactionSummary, rate: Option<f64>) -> String {
        let tx_link = render_template(&self.block_explorer, |key| (key == "hash").then(|| tx.hash.clone()));
        let fiat_amount = rate.map(|r| group_thousands(tx.amount * r, 0));
        let fiat_fee = rate.map(|r| group_thousands((tx.fee * r).max(MIN_FIAT_FEE), 4));

        render_template(&self.template, |key| match key {
            "amount" => Some(group_thousands(tx.amount, 0)),
            "symbol" => Some(self.symbol.clone()),
            "fee" => Some(format!("{:.8}", tx.fee)),
            "fiat_amount" => Some(fiat_amount.clone().unwrap_or_else(|| "?".into())),
            "fiat_fee" => Some(fiat_fee.clone().unwrap_or_else(|| "?".into())),
            "fiat_symbol" => Some(self.fiat_symbol.clone()),
            "hash" => Some(tx.hash.clone()),
            "tx_link" => Some(tx_link.clone()),
            "block_height" => Some(tx.block_height.to_string()),
            _ => None,
        })
    }
}

/// Replace `{key}` placeholders using `lookup`. Unknown keys are left as written.
pub fn render_template(template: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let key = &after[..end];
        match lookup(key) {
            Some(value) => out.push_str(&value),
            None => {
                out.push('{');
                out.push_str(key);
                out.push('}');
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

/// Format with a fixed number of decimals and comma-grouped thousands.
pub fn group_thousands(value: f64, decimals: usize) -> String {
    let formatted = format!("{:.*}", decimals, value.abs());
    let (int_part, frac_part) = match formatted.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (formatted.as_str(), None),
    };

    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3 + 2);
    if value.is_sign_negative() && formatted.chars().any(|c| c.is_ascii_digit() && c != '0') {
        grouped.push('-');
    }
    for (i, c) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    if let Some(frac) = frac_part {
        grouped.push('.');
        grouped.push_str(frac);
    }
    grouped
}
