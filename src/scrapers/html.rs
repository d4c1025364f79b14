//! Small helpers shared by the HTML result-page parsers.

use std::str::FromStr;

use rust_decimal::Decimal;
use scraper::{ElementRef, Selector};

/// Collapsed text content of the first match of `selector` under `root`
pub fn text_of(root: ElementRef<'_>, selector: &Selector) -> Option<String> {
    root.select(selector)
        .next()
        .map(|el| collapse(&el.text().collect::<String>()))
        .filter(|t| !t.is_empty())
}

pub fn attr_of(root: ElementRef<'_>, selector: &Selector, attr: &str) -> Option<String> {
    root.select(selector)
        .next()
        .and_then(|el| el.value().attr(attr))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub fn collapse(text: &str) -> String {
    text.replace('\u{a0}', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Make a site-relative link absolute
pub fn absolute_url(href: &str, origin: &str) -> String {
    if href.starts_with("http") {
        href.to_string()
    } else if href.starts_with("//") {
        format!("https:{href}")
    } else {
        format!("{}{}", origin.trim_end_matches('/'), href)
    }
}

/// Highest page number among the links under `root`, at least 1
pub fn max_page_number(root: ElementRef<'_>, link: &Selector) -> u32 {
    root.select(link)
        .filter_map(|a| collapse(&a.text().collect::<String>()).parse::<u32>().ok())
        .max()
        .unwrap_or(1)
        .max(1)
}

/// Keep digits and the given decimal separator, then parse.
/// `"€ 24.990,50"` with `','` → 24990.50, `"$31,500"` with `'.'` → 31500.
pub fn parse_amount(text: &str, decimal_separator: char) -> Option<Decimal> {
    let normalized: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == decimal_separator)
        .map(|c| if c == decimal_separator { '.' } else { c })
        .collect();
    if normalized.is_empty() {
        return None;
    }
    Decimal::from_str(&normalized).ok()
}

pub fn digits(text: &str) -> Option<i64> {
    let digits: String = text.chars().filter(char::is_ascii_digit).collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amounts_in_both_locales() {
        assert_eq!(parse_amount("€ 24.990,50", ','), Decimal::from_str("24990.50").ok());
        assert_eq!(parse_amount("$31,500", '.'), Some(Decimal::from(31_500)));
        assert_eq!(parse_amount("Preis auf Anfrage", ','), None);
    }

    #[test]
    fn relative_links_get_the_origin() {
        assert_eq!(absolute_url("/vehicledetail/1/", "https://www.cars.com"), "https://www.cars.com/vehicledetail/1/");
        assert_eq!(absolute_url("https://a.test/x", "https://www.cars.com"), "https://a.test/x");
    }
}
