use chrono::{DateTime, Utc};
use mailparse::{MailAddr, MailHeaderMap, dateparse};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("missing {0} header")]
    MissingHeader(&'static str),
    #[error("unparseable date: {0}")]
    BadDate(String),
    #[error(transparent)]
    Mail(#[from] mailparse::MailParseError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub name: String,
    pub address: String,
}

#[derive(Debug, Clone)]
pub struct ParsedArticle {
    pub message_id: String,
    pub subject: String,
    pub date_utc: String,
    pub date_offset: String,
    pub lines: Option<i64>,
    pub sender: Address,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub in_reply_to: Vec<String>,
    pub references: Vec<String>,
    pub header: Vec<u8>,
    pub body: Vec<u8>,
}

pub fn parse_article(lines: &[Vec<u8>]) -> Result<ParsedArticle, ParseError> {
    let (header, body) = slice_article(lines);
    let (headers, _) = mailparse::parse_headers(&header)?;

    let message_id = headers
        .get_first_value("Message-Id")
        .map(|v| v.trim().to_string())
        .ok_or(ParseError::MissingHeader("Message-Id"))?;
    let subject = headers.get_first_value("Subject").unwrap_or_default();
    let date = headers
        .get_first_value("Date")
        .ok_or(ParseError::MissingHeader("Date"))?;
    let (date_utc, date_offset) = normalize_date(&date)?;
    let lines_count = headers
        .get_first_value("Lines")
        .and_then(|v| v.trim().parse().ok());

    let from = headers
        .get_first_value("From")
        .ok_or(ParseError::MissingHeader("From"))?;
    let sender = addresses(&from).into_iter().next().unwrap_or(Address {
        name: String::new(),
        address: String::new(),
    });

    let mut to = Vec::new();
    for value in headers.get_all_values("To") {
        to.extend(addresses(&value));
    }
    let mut cc = Vec::new();
    for value in headers.get_all_values("Cc") {
        cc.extend(addresses(&value));
    }

    let in_reply_to = headers
        .get_first_value("In-Reply-To")
        .map(|v| reference_tokens(&v))
        .unwrap_or_default();
    let references = headers
        .get_first_value("References")
        .map(|v| reference_tokens(&v))
        .unwrap_or_default();

    Ok(ParsedArticle {
        message_id,
        subject,
        date_utc,
        date_offset,
        lines: lines_count,
        sender,
        to,
        cc,
        in_reply_to,
        references,
        header,
        body,
    })
}

pub fn slice_article(lines: &[Vec<u8>]) -> (Vec<u8>, Vec<u8>) {
    let mut header: Vec<&[u8]> = Vec::new();
    let mut body: Vec<&[u8]> = Vec::new();
    let mut in_body = false;

    // The separator blank line stays with the header block.
    for line in lines {
        if in_body {
            body.push(line);
            continue;
        }
        if line.is_empty() {
            in_body = true;
        }
        header.push(line);
    }

    (header.join(&b"\r\n"[..]), body.join(&b"\r\n"[..]))
}

pub fn reference_tokens(value: &str) -> Vec<String> {
    value
        .replace("><", "> <")
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

fn normalize_date(value: &str) -> Result<(String, String), ParseError> {
    let trimmed = value.trim();
    let parsed = DateTime::parse_from_rfc2822(trimmed)
        // A date without zone info is taken as UTC.
        .or_else(|_| DateTime::parse_from_rfc2822(&format!("{trimmed} +0000")));
    if let Ok(date) = parsed {
        return Ok((
            date.with_timezone(&Utc)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string(),
            date.format("%z").to_string(),
        ));
    }
    let epoch = dateparse(trimmed).map_err(|_| ParseError::BadDate(trimmed.to_string()))?;
    let date = DateTime::<Utc>::from_timestamp(epoch, 0)
        .ok_or_else(|| ParseError::BadDate(trimmed.to_string()))?;
    Ok((
        date.format("%Y-%m-%d %H:%M:%S").to_string(),
        "+0000".to_string(),
    ))
}

fn addresses(value: &str) -> Vec<Address> {
    let Ok(parsed) = mailparse::addrparse(value) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for addr in parsed.iter() {
        match addr {
            MailAddr::Single(info) => out.push(Address {
                name: info.display_name.clone().unwrap_or_default(),
                address: info.addr.clone(),
            }),
            MailAddr::Group(group) => {
                for info in &group.addrs {
                    out.push(Address {
                        name: info.display_name.clone().unwrap_or_default(),
                        address: info.addr.clone(),
                    });
                }
            }
        }
    }
    out
}
