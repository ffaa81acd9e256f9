//! Parser and serializer for the ISO entries of GRUB's `custom.cfg`.
//!
//! Two line forms are understood:
//!
//! ```text
//! 	submenu "<name>" {iso_boot "<iso>" ["<loopback>"]} #<mount point>
//! amorce_iso "<iso>" ["<loopback>"] #<mount point>
//! ```
//!
//! The first is a durable menu entry, the second a one-shot boot armed
//! through the GRUB environment. Any other line is kept verbatim and
//! written back in place. The trailing comment carries the host mount
//! point the paths are relative to; GRUB ignores it.

use std::fmt::Write as _;

use camino::Utf8PathBuf;

use super::tokenizer::{quote, tokenize, Token};
use crate::entry::EntryRecord;
use crate::error::ConfigError;

/// First line of every generated `custom.cfg`; loads the functions entries call.
pub const INCIPIT: &str = "source ${prefix}/greffons/fonctions_iso.cfg";

const SUBMENU: &str = "submenu";
const ISO_BOOT: &str = "iso_boot";
const AMORCE_ISO: &str = "amorce_iso";

/// One line of a parsed `custom.cfg`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigItem {
    /// An ISO boot entry
    Entry(EntryRecord),
    /// A line we do not manage, kept as-is
    Passthrough(String),
}

/// A borrowed view of a line to serialize.
#[derive(Debug, Clone, Copy)]
pub enum Line<'a> {
    /// An ISO boot entry; placeholders are skipped
    Entry(&'a EntryRecord),
    /// A verbatim line, without terminator
    Passthrough(&'a str),
}

/// The contents of a `custom.cfg`, in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CustomConfig {
    /// Entries and passthrough lines
    pub items: Vec<ConfigItem>,
}

impl CustomConfig {
    /// Iterate over the boot entries.
    pub fn entries(&self) -> impl Iterator<Item = &EntryRecord> {
        self.items.iter().filter_map(|item| match item {
            ConfigItem::Entry(e) => Some(e),
            ConfigItem::Passthrough(_) => None,
        })
    }

    /// Render back to text.
    pub fn serialize(&self) -> Result<String, ConfigError> {
        serialize_lines(self.items.iter().map(|item| match item {
            ConfigItem::Entry(e) => Line::Entry(e),
            ConfigItem::Passthrough(l) => Line::Passthrough(l),
        }))
    }
}

fn malformed(line: usize, text: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::MalformedLine {
        line,
        text: text.to_owned(),
        reason: reason.into(),
    }
}

fn is_entry_keyword(token: &Token) -> bool {
    matches!(token, Token::Word(w) if w == ISO_BOOT || w == AMORCE_ISO)
}

/// Split the optional quoted loopback location off the tokens following the ISO.
fn split_loopback(rest: &[Token]) -> (Option<&String>, &[Token]) {
    match rest {
        [Token::Quoted(l), rest @ ..] => (Some(l), rest),
        rest => (None, rest),
    }
}

fn parse_entry(lineno: usize, line: &str, tokens: &[Token]) -> Result<EntryRecord, ConfigError> {
    let (name, iso, loopback, mount) = match tokens {
        [
            Token::Word(submenu),
            Token::Quoted(name),
            Token::OpenBrace,
            Token::Word(kw),
            Token::Quoted(iso),
            rest @ ..,
        ] if submenu == SUBMENU && kw == ISO_BOOT => {
            let (loopback, rest) = split_loopback(rest);
            let [Token::CloseBrace, Token::Comment(mount)] = rest else {
                return Err(malformed(
                    lineno,
                    line,
                    "expected `} #<mount point>` after iso_boot arguments",
                ));
            };
            if name.is_empty() {
                return Err(malformed(lineno, line, "empty entry name"));
            }
            (Some(name), iso, loopback, mount)
        }
        [Token::Word(kw), Token::Quoted(iso), rest @ ..] if kw == AMORCE_ISO => {
            let (loopback, rest) = split_loopback(rest);
            let [Token::Comment(mount)] = rest else {
                return Err(malformed(
                    lineno,
                    line,
                    "expected `#<mount point>` after amorce_iso arguments",
                ));
            };
            (None, iso, loopback, mount)
        }
        _ => {
            return Err(malformed(
                lineno,
                line,
                "expected `submenu \"<name>\" {iso_boot ...}` or `amorce_iso ...`",
            ))
        }
    };

    if !iso.starts_with('/') {
        return Err(malformed(lineno, line, "ISO location must start with /"));
    }
    if loopback.is_some_and(|l| !l.starts_with('/')) {
        return Err(malformed(lineno, line, "loopback location must start with /"));
    }
    let mount = mount.trim_end();
    if mount.is_empty() {
        return Err(malformed(lineno, line, "missing mount point"));
    }

    let iso_location = Utf8PathBuf::from(iso);
    let mut entry = match name {
        Some(name) => EntryRecord::permanent(name.as_str(), iso_location, mount),
        None => EntryRecord::temporary(iso_location, mount),
    };
    if let Some(l) = loopback {
        entry = entry.with_loopback_location(l.as_str());
    }
    Ok(entry)
}

fn parse_line(lineno: usize, line: &str) -> Result<Option<ConfigItem>, ConfigError> {
    if line.trim() == INCIPIT {
        return Ok(None);
    }
    let mentions_keyword = line.contains(ISO_BOOT) || line.contains(AMORCE_ISO);
    let tokens = match tokenize(line) {
        Ok(tokens) => tokens,
        Err(e) if mentions_keyword => return Err(malformed(lineno, line, e.to_string())),
        Err(e) => {
            tracing::trace!("line {lineno}: passing through untokenizable line: {e}");
            return Ok(Some(ConfigItem::Passthrough(line.to_owned())));
        }
    };
    if !tokens.iter().any(is_entry_keyword) {
        return Ok(Some(ConfigItem::Passthrough(line.to_owned())));
    }
    let entry = parse_entry(lineno, line, &tokens)?;
    tracing::trace!("line {lineno}: parsed entry {:?}", entry.name);
    Ok(Some(ConfigItem::Entry(entry)))
}

/// Parse the text of a `custom.cfg`.
///
/// The [`INCIPIT`] line is dropped, as serialization always emits it. A line
/// invoking `iso_boot` or `amorce_iso` that does not match an entry form
/// fails the whole parse.
pub fn parse(text: &str) -> Result<CustomConfig, ConfigError> {
    let items = text
        .lines()
        .enumerate()
        .filter_map(|(i, line)| parse_line(i + 1, line).transpose())
        .collect::<Result<Vec<_>, _>>()?;
    Ok(CustomConfig { items })
}

/// Parse the text of a `custom.cfg`, keeping only the boot entries.
pub fn parse_entries(text: &str) -> Result<Vec<EntryRecord>, ConfigError> {
    Ok(parse(text)?.entries().cloned().collect())
}

fn representable<'a>(field: &'static str, value: &'a str) -> Result<&'a str, ConfigError> {
    if value.contains(['\n', '\r']) {
        return Err(ConfigError::Unrepresentable {
            field,
            value: value.to_owned(),
        });
    }
    Ok(value)
}

fn render_entry(out: &mut String, entry: &EntryRecord) -> Result<(), ConfigError> {
    let iso = representable("ISO location", entry.iso_location.as_str())?;
    if iso.is_empty() {
        return Err(ConfigError::Unrepresentable {
            field: "ISO location",
            value: String::new(),
        });
    }
    let loopback = entry
        .loopback_location
        .as_deref()
        .map(|l| representable("loopback location", l.as_str()))
        .transpose()?;
    let mount = representable("mount point", entry.mount_point.as_str())?;

    let mut args = quote(iso);
    if let Some(loopback) = loopback {
        args.push(' ');
        args.push_str(&quote(loopback));
    }

    // Writing to a String cannot fail
    if entry.permanent {
        let name = representable("name", &entry.name)?;
        let _ = writeln!(out, "\t{SUBMENU} {} {{{ISO_BOOT} {args}}} #{mount}", quote(name));
    } else {
        let _ = writeln!(out, "{AMORCE_ISO} {args} #{mount}");
    }
    Ok(())
}

/// Render lines to `custom.cfg` text, starting with [`INCIPIT`].
pub fn serialize_lines<'a>(
    lines: impl IntoIterator<Item = Line<'a>>,
) -> Result<String, ConfigError> {
    let mut out = String::new();
    out.push_str(INCIPIT);
    out.push('\n');
    for line in lines {
        match line {
            Line::Entry(e) if e.is_placeholder() => {}
            Line::Entry(e) => render_entry(&mut out, e)?,
            Line::Passthrough(l) => {
                out.push_str(l);
                out.push('\n');
            }
        }
    }
    Ok(out)
}

/// Render boot entries to `custom.cfg` text.
pub fn serialize(entries: &[EntryRecord]) -> Result<String, ConfigError> {
    serialize_lines(entries.iter().map(Line::Entry))
}

#[cfg(test)]
mod tests {
    use camino::Utf8Path;
    use indoc::indoc;
    use similar_asserts::assert_eq;

    use super::*;

    const LINE_A: &str = "\tsubmenu \"Ubuntu\" {iso_boot \"/isos/ubuntu.iso\"} #/mnt\n";
    const LINE_B: &str = "amorce_iso \"/isos/test.iso\" \"/isos/test.loopback.cfg\" #/mnt\n";

    fn record_a() -> EntryRecord {
        EntryRecord::permanent("Ubuntu", "/isos/ubuntu.iso", "/mnt")
    }

    fn record_b() -> EntryRecord {
        EntryRecord::temporary("/isos/test.iso", "/mnt")
            .with_loopback_location("/isos/test.loopback.cfg")
    }

    #[test]
    fn test_parse_permanent() {
        let text = format!("{INCIPIT}\n{LINE_A}");
        let entries = parse_entries(&text).unwrap();
        assert_eq!(entries.len(), 1);
        let e = &entries[0];
        assert_eq!(e.name, "Ubuntu");
        assert_eq!(e.iso_location, "/isos/ubuntu.iso");
        assert_eq!(e.loopback_location, None);
        assert!(e.permanent);
        assert_eq!(e.mount_point, "/mnt");
        assert_eq!(e, &record_a());
    }

    #[test]
    fn test_parse_temporary() {
        let entries = parse_entries(LINE_B).unwrap();
        assert_eq!(entries.len(), 1);
        let e = &entries[0];
        assert_eq!(e.name, "test.iso");
        assert_eq!(e.iso_location, "/isos/test.iso");
        assert_eq!(
            e.loopback_location.as_deref(),
            Some(Utf8Path::new("/isos/test.loopback.cfg"))
        );
        assert!(!e.permanent);
        assert_eq!(e.mount_point, "/mnt");
    }

    #[test]
    fn test_serialize_both() {
        let out = serialize(&[record_a(), record_b()]).unwrap();
        assert_eq!(out, format!("{INCIPIT}\n{LINE_A}{LINE_B}"));
    }

    #[test]
    fn test_serialize_templates() {
        let entries = [
            record_a().with_loopback_location("/isos/ubuntu.loopback.cfg"),
            record_a(),
            record_b(),
            EntryRecord::temporary("/isos/test.iso", "/mnt"),
        ];
        let expected = indoc! { r#"
            source ${prefix}/greffons/fonctions_iso.cfg
            	submenu "Ubuntu" {iso_boot "/isos/ubuntu.iso" "/isos/ubuntu.loopback.cfg"} #/mnt
            	submenu "Ubuntu" {iso_boot "/isos/ubuntu.iso"} #/mnt
            amorce_iso "/isos/test.iso" "/isos/test.loopback.cfg" #/mnt
            amorce_iso "/isos/test.iso" #/mnt
        "# };
        assert_eq!(serialize(&entries).unwrap(), expected);
    }

    #[test]
    fn test_roundtrip() {
        let entries = vec![
            record_a(),
            record_b(),
            EntryRecord::permanent(
                "Debian {testing} \"live\"",
                "/My ISOs/debian.iso",
                "/media/user/USB KEY",
            )
            .with_loopback_location("/My ISOs/debian.loopback.cfg"),
            EntryRecord::temporary("/a b/c $d.iso", "/"),
            EntryRecord::permanent("back\\slash # not a comment", "/x.iso", "/data"),
        ];
        let text = serialize(&entries).unwrap();
        assert_eq!(parse_entries(&text).unwrap(), entries);
    }

    #[test]
    fn test_quoting_safety() {
        let entry = EntryRecord::permanent("My Movies {2024}", "/isos/movies.iso", "/mnt");
        let text = serialize(std::slice::from_ref(&entry)).unwrap();
        let line = "\tsubmenu \"My Movies {2024}\" {iso_boot \"/isos/movies.iso\"} #/mnt\n";
        assert_eq!(text, format!("{INCIPIT}\n{line}"));
        assert_eq!(parse_entries(&text).unwrap(), [entry]);
    }

    #[test]
    fn test_passthrough_preserved() {
        let text = indoc! { r#"
            source ${prefix}/greffons/fonctions_iso.cfg
            # My own entries
            menuentry "Windows" {
            	chainloader +1
            }
            	submenu "Ubuntu" {iso_boot "/isos/ubuntu.iso"} #/mnt

            set timeout="5"
            amorce_iso "/isos/test.iso" "/isos/test.loopback.cfg" #/mnt
        "# };
        let config = parse(text).unwrap();
        assert_eq!(config.entries().count(), 2);
        assert_eq!(config.items.len(), 8);
        assert_eq!(
            config.items[0],
            ConfigItem::Passthrough("# My own entries".into())
        );
        assert_eq!(config.items[4], ConfigItem::Entry(record_a()));
        assert_eq!(config.items[5], ConfigItem::Passthrough("".into()));
        assert_eq!(config.serialize().unwrap(), text);
    }

    #[test]
    fn test_incipit_not_duplicated() {
        let text = format!("{INCIPIT}\n{LINE_A}");
        let config = parse(&text).unwrap();
        assert_eq!(config.serialize().unwrap(), text);
        let config = parse(&config.serialize().unwrap()).unwrap();
        assert_eq!(config.serialize().unwrap(), text);
    }

    #[test]
    fn test_comment_mentioning_keyword_passes_through() {
        let text = "# entries use iso_boot and amorce_iso\nmenuentry \"iso_boot\" {\n}\n";
        let config = parse(text).unwrap();
        assert_eq!(config.entries().count(), 0);
        assert_eq!(config.items.len(), 3);
    }

    #[test]
    fn test_malformed() {
        let cases = [
            ("\tsubmenu \"Ubuntu\" {iso_boot \"/isos/ubuntu.iso\"}", "mount point"),
            ("\tsubmenu \"Ubuntu\" {iso_boot /isos/ubuntu.iso} #/mnt", "submenu"),
            ("amorce_iso \"/isos/test.iso #/mnt", "unterminated"),
            ("amorce_iso \"isos/test.iso\" #/mnt", "must start with /"),
            ("amorce_iso \"/isos/test.iso\" #", "missing mount point"),
            ("\tsubmenu \"\" {iso_boot \"/isos/ubuntu.iso\"} #/mnt", "empty entry name"),
            ("amorce_iso \"/a.iso\" \"/b.cfg\" \"/c\" #/mnt", "amorce_iso arguments"),
        ];
        for (line, expected) in cases {
            let text = format!("{INCIPIT}\n# comment\n{line}\n");
            let err = parse(&text).unwrap_err();
            match &err {
                ConfigError::MalformedLine { line: n, text, .. } => {
                    assert_eq!(*n, 3);
                    assert_eq!(text, line);
                }
                other => panic!("unexpected error {other:?}"),
            }
            let msg = err.to_string();
            assert!(msg.contains(expected), "{msg} does not contain {expected}");
        }
    }

    #[test]
    fn test_serialize_skips_placeholder() {
        let entries = [EntryRecord::placeholder(true), record_a()];
        assert_eq!(
            serialize(&entries).unwrap(),
            format!("{INCIPIT}\n{LINE_A}")
        );
    }

    #[test]
    fn test_serialize_unrepresentable() {
        let entry = EntryRecord::permanent("two\nlines", "/a.iso", "/mnt");
        assert!(matches!(
            serialize(&[entry]),
            Err(ConfigError::Unrepresentable { field: "name", .. })
        ));
        let entry = EntryRecord::permanent("ok", "/a.iso", "/mnt\n");
        assert!(matches!(
            serialize(&[entry]),
            Err(ConfigError::Unrepresentable { field: "mount point", .. })
        ));
        let entry = EntryRecord::permanent("ok", "", "/mnt");
        assert!(serialize(&[entry]).is_err());
    }
}
