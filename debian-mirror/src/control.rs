// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Control file paragraphs.

`Release`, `Packages`, and `Sources` files are all *control files*: a series
of paragraphs separated by blank lines, each holding `Name: value` fields. Values
may continue onto following lines that begin with whitespace.

See <https://www.debian.org/doc/debian-policy/ch-controlfields.html>
for the canonical source of truth for how control files work.
*/

use {
    crate::error::{MirrorError, Result},
    futures::{AsyncBufRead, AsyncBufReadExt},
    std::io::BufRead,
};

/// A paragraph in a control file.
///
/// A paragraph is an ordered series of fields. Field names are case insensitive on
/// read and case preserving on set. A field occurs at most once.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ControlParagraph {
    fields: Vec<(String, String)>,
}

impl ControlParagraph {
    /// Whether the paragraph has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Set the value of a field, replacing any existing value.
    pub fn set_field(&mut self, name: impl ToString, value: impl ToString) {
        let name = name.to_string();
        self.fields.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.fields.push((name, value.to_string()));
    }

    /// Iterate over `(name, value)` pairs in insertion order.
    pub fn iter_fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Obtain the raw string value of the named field.
    ///
    /// Multiple line values retain their line breaks and leading whitespace.
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Obtain the value of a field evaluated as a boolean.
    ///
    /// The field is [true] iff its value is `yes`.
    pub fn field_bool(&self, name: &str) -> Option<bool> {
        self.field_str(name).map(|v| v == "yes")
    }

    /// Obtain the value of a field parsed as an unsigned integer.
    pub fn field_u64(&self, name: &str) -> Option<std::result::Result<u64, std::num::ParseIntError>> {
        self.field_str(name).map(|v| v.trim().parse::<u64>())
    }

    /// Iterate over whitespace delimited words in the named field.
    pub fn iter_field_words(&self, name: &str) -> Option<impl Iterator<Item = &str>> {
        self.field_str(name).map(|v| v.split_ascii_whitespace())
    }

    /// Iterate over non-empty lines in the named field, with leading whitespace stripped.
    ///
    /// The first line of fields like `SHA256` in `Release` files is empty and is skipped.
    pub fn iter_field_lines(&self, name: &str) -> Option<impl Iterator<Item = &str>> {
        self.field_str(name).map(|v| {
            v.lines()
                .map(|line| line.trim())
                .filter(|line| !line.is_empty())
        })
    }
}

impl std::fmt::Display for ControlParagraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (name, value) in &self.fields {
            writeln!(f, "{}: {}", name, value)?;
        }

        Ok(())
    }
}

/// Holds parsing state for control files.
///
/// Instances are fed lines of text and emit [ControlParagraph] as they complete.
#[derive(Clone, Debug)]
pub struct ControlFileParser {
    path: String,
    paragraph: ControlParagraph,
    field: Option<String>,
}

impl ControlFileParser {
    /// Construct a parser. `path` names the source in error messages.
    pub fn new(path: impl ToString) -> Self {
        Self {
            path: path.to_string(),
            paragraph: ControlParagraph::default(),
            field: None,
        }
    }

    /// Write a line to the parser.
    ///
    /// If the line terminates an in-progress paragraph, that paragraph is returned.
    pub fn write_line(&mut self, line: &str) -> Result<Option<ControlParagraph>> {
        let is_empty_line = line.trim().is_empty();
        let is_continuation = line.starts_with(|c: char| c == ' ' || c == '\t');

        if is_empty_line {
            if let Some(field) = self.field.take() {
                self.flush_field(field)?;
            }

            return Ok(if self.paragraph.is_empty() {
                None
            } else {
                Some(std::mem::take(&mut self.paragraph))
            });
        }

        match (self.field.take(), is_continuation) {
            (Some(field), true) => {
                self.field = Some(field + line);
            }
            (Some(field), false) => {
                self.flush_field(field)?;
                self.field = Some(line.to_string());
            }
            (None, true) => {
                return Err(self.error(format!(
                    "continuation line without a field: {}",
                    line.trim_end()
                )));
            }
            (None, false) => {
                self.field = Some(line.to_string());
            }
        }

        Ok(None)
    }

    /// Finish parsing, returning any paragraph not terminated by a blank line.
    pub fn finish(mut self) -> Result<Option<ControlParagraph>> {
        if let Some(field) = self.field.take() {
            self.flush_field(field)?;
        }

        Ok(if self.paragraph.is_empty() {
            None
        } else {
            Some(self.paragraph)
        })
    }

    fn flush_field(&mut self, v: String) -> Result<()> {
        let (name, value) = v
            .split_once(':')
            .ok_or_else(|| self.error(format!("line lacks a colon: {}", v.trim_end())))?;

        let name = name.trim();
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(self.error(format!("bad field name: {}", name)));
        }

        self.paragraph.set_field(name, value.trim());

        Ok(())
    }

    fn error(&self, message: String) -> MirrorError {
        MirrorError::Parse {
            path: self.path.clone(),
            message,
        }
    }
}

/// Iterator over paragraphs of a synchronous reader.
pub struct ControlParagraphReader<R: BufRead> {
    reader: R,
    parser: Option<ControlFileParser>,
}

impl<R: BufRead> ControlParagraphReader<R> {
    /// Create a new instance bound to a reader.
    pub fn new(reader: R, path: impl ToString) -> Self {
        Self {
            reader,
            parser: Some(ControlFileParser::new(path)),
        }
    }

    fn get_next(&mut self) -> Result<Option<ControlParagraph>> {
        let mut parser = match self.parser.take() {
            Some(parser) => parser,
            None => return Ok(None),
        };

        loop {
            let mut line = String::new();

            if self
                .reader
                .read_line(&mut line)
                .map_err(|e| MirrorError::io_path(&parser.path, e))?
                == 0
            {
                return parser.finish();
            }

            if let Some(paragraph) = parser.write_line(&line)? {
                self.parser.replace(parser);
                return Ok(Some(paragraph));
            }
        }
    }
}

impl<R: BufRead> Iterator for ControlParagraphReader<R> {
    type Item = Result<ControlParagraph>;

    fn next(&mut self) -> Option<Self::Item> {
        self.get_next().transpose()
    }
}

/// An asynchronous reader of [ControlParagraph].
pub struct ControlParagraphAsyncReader<R> {
    reader: R,
    parser: Option<ControlFileParser>,
}

impl<R> ControlParagraphAsyncReader<R>
where
    R: AsyncBufRead + Unpin,
{
    /// Create a new instance bound to a reader.
    pub fn new(reader: R, path: impl ToString) -> Self {
        Self {
            reader,
            parser: Some(ControlFileParser::new(path)),
        }
    }

    /// Read the next available paragraph from this reader.
    ///
    /// Resolves to [None] on end of input.
    pub async fn read_paragraph(&mut self) -> Result<Option<ControlParagraph>> {
        let mut parser = match self.parser.take() {
            Some(parser) => parser,
            None => return Ok(None),
        };

        loop {
            let mut line = String::new();

            let bytes_read = self
                .reader
                .read_line(&mut line)
                .await
                .map_err(|e| MirrorError::Parse {
                    path: parser.path.clone(),
                    message: format!("error reading index data: {}", e),
                })?;

            if bytes_read == 0 {
                return parser.finish();
            }

            if let Some(paragraph) = parser.write_line(&line)? {
                self.parser.replace(parser);
                return Ok(Some(paragraph));
            }
        }
    }
}
