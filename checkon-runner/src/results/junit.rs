// Copyright (c) The checkon Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Event-driven parsing of pytest JUnit reports.
//!
//! The expected shape is one `<testsuites>` root containing exactly one `<testsuite>`. Anything
//! else is rejected rather than guessed at: a report with zero or several suites would otherwise
//! silently drop or merge results.

use super::{
    EnvironmentName, Failure, FailureKind, SuiteCounts, TestCaseResult, TestSuiteResult,
};
use crate::errors::ParseErrorKind;
use chrono::{DateTime, FixedOffset, NaiveDateTime};
use quick_xml::{
    Reader,
    events::{BytesStart, Event},
};
use std::{fmt, str::FromStr, time::Duration};

pub(super) fn parse_suite(
    input: &str,
    environment: EnvironmentName,
) -> Result<TestSuiteResult, ParseErrorKind> {
    let mut reader = Reader::from_str(input);
    let mut stack = vec![Frame::Document {
        roots: 0,
        suites: None,
    }];

    loop {
        let event = reader
            .read_event()
            .map_err(|err| xml_error(reader.error_position() as u64, err))?;
        let position = reader.buffer_position() as u64;
        match event {
            Event::Start(start) => {
                let frame = open(stack.last_mut(), &start, position)?;
                stack.push(frame);
            }
            Event::Empty(start) => {
                let frame = open(stack.last_mut(), &start, position)?;
                close(&mut stack, frame, &environment)?;
            }
            Event::End(_) => {
                if stack.len() <= 1 {
                    return Err(ParseErrorKind::Unbalanced { position });
                }
                if let Some(frame) = stack.pop() {
                    close(&mut stack, frame, &environment)?;
                }
            }
            Event::Text(text) => {
                if let Some(Frame::Block(block)) = stack.last_mut() {
                    let text = text
                        .unescape()
                        .map_err(|err| xml_error(position, err.into()))?;
                    block.text.push_str(&text);
                }
            }
            Event::CData(cdata) => {
                if let Some(Frame::Block(block)) = stack.last_mut() {
                    let text = std::str::from_utf8(&cdata)
                        .map_err(|err| ParseErrorKind::InvalidText { position, err })?;
                    block.text.push_str(text);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if stack.len() != 1 {
        return Err(ParseErrorKind::UnexpectedEof);
    }
    match stack.pop() {
        Some(Frame::Document {
            suites: Some(mut suites),
            ..
        }) => {
            if suites.len() == 1 {
                Ok(suites.remove(0))
            } else {
                Err(ParseErrorKind::SuiteCount {
                    found: suites.len(),
                })
            }
        }
        _ => Err(ParseErrorKind::MissingRoot),
    }
}

#[derive(Debug)]
enum Frame {
    Document {
        roots: usize,
        suites: Option<Vec<TestSuiteResult>>,
    },
    Testsuites {
        suites: Vec<TestSuiteResult>,
    },
    Testsuite(SuiteBuilder),
    Testcase(CaseBuilder),
    Block(BlockBuilder),
    Ignored,
}

fn open(
    parent: Option<&mut Frame>,
    start: &BytesStart<'_>,
    position: u64,
) -> Result<Frame, ParseErrorKind> {
    let name = start.name();
    let name = name.as_ref();
    let Some(parent) = parent else {
        return Err(ParseErrorKind::Unbalanced { position });
    };

    match parent {
        Frame::Document { roots, .. } => {
            *roots += 1;
            if *roots > 1 {
                Err(ParseErrorKind::MultipleRoots)
            } else if name == b"testsuites" {
                Ok(Frame::Testsuites { suites: Vec::new() })
            } else {
                Err(ParseErrorKind::UnexpectedRoot {
                    found: String::from_utf8_lossy(name).into_owned(),
                })
            }
        }
        Frame::Testsuites { .. } if name == b"testsuite" => {
            let attrs = Attributes::collect("testsuite", start, position)?;
            Ok(Frame::Testsuite(SuiteBuilder::new(&attrs)?))
        }
        Frame::Testsuite(_) if name == b"testcase" => {
            let attrs = Attributes::collect("testcase", start, position)?;
            Ok(Frame::Testcase(CaseBuilder::new(&attrs)?))
        }
        Frame::Testcase(case) => match name {
            b"failure" => {
                let attrs = Attributes::collect("failure", start, position)?;
                Ok(Frame::Block(BlockBuilder::new(FailureKind::Failure, &attrs)))
            }
            b"error" => {
                let attrs = Attributes::collect("error", start, position)?;
                Ok(Frame::Block(BlockBuilder::new(FailureKind::Error, &attrs)))
            }
            b"skipped" => {
                case.skipped = true;
                Ok(Frame::Ignored)
            }
            _ => Ok(Frame::Ignored),
        },
        _ => Ok(Frame::Ignored),
    }
}

fn close(
    stack: &mut [Frame],
    frame: Frame,
    environment: &EnvironmentName,
) -> Result<(), ParseErrorKind> {
    let Some(parent) = stack.last_mut() else {
        return Err(ParseErrorKind::UnexpectedEof);
    };
    match (frame, parent) {
        (Frame::Block(block), Frame::Testcase(case)) => case.blocks.push(block.finish()),
        (Frame::Testcase(case), Frame::Testsuite(suite)) => suite.test_cases.push(case.finish()?),
        (Frame::Testsuite(suite), Frame::Testsuites { suites }) => {
            suites.push(suite.finish(environment.clone()))
        }
        (Frame::Testsuites { suites }, Frame::Document { suites: slot, .. }) => {
            *slot = Some(suites)
        }
        _ => {}
    }
    Ok(())
}

#[derive(Debug)]
struct SuiteBuilder {
    name: String,
    counts: SuiteCounts,
    duration: Option<Duration>,
    timestamp: Option<DateTime<FixedOffset>>,
    host: Option<String>,
    test_cases: Vec<TestCaseResult>,
}

impl SuiteBuilder {
    fn new(attrs: &Attributes) -> Result<Self, ParseErrorKind> {
        let counts = SuiteCounts {
            errors: attrs.required_parsed("errors", usize::from_str)?,
            failures: attrs.required_parsed("failures", usize::from_str)?,
            skipped: attrs.required_parsed("skipped", usize::from_str)?,
            total: attrs.required_parsed("tests", usize::from_str)?,
        };
        Ok(Self {
            name: attrs.get("name").unwrap_or_default().to_owned(),
            counts,
            duration: attrs.optional_parsed("time", parse_duration)?,
            timestamp: attrs.optional_parsed("timestamp", parse_timestamp)?,
            host: attrs.get("hostname").map(str::to_owned),
            test_cases: Vec::new(),
        })
    }

    fn finish(self, environment: EnvironmentName) -> TestSuiteResult {
        TestSuiteResult {
            environment,
            name: self.name,
            counts: self.counts,
            duration: self.duration,
            timestamp: self.timestamp,
            host: self.host,
            test_cases: self.test_cases,
        }
    }
}

#[derive(Debug)]
struct CaseBuilder {
    name: String,
    classname: Option<String>,
    file: Option<String>,
    line: Option<u32>,
    duration: Option<Duration>,
    skipped: bool,
    blocks: Vec<Failure>,
}

impl CaseBuilder {
    fn new(attrs: &Attributes) -> Result<Self, ParseErrorKind> {
        Ok(Self {
            name: attrs.required("name")?.to_owned(),
            classname: attrs.get("classname").map(str::to_owned),
            file: attrs.get("file").map(str::to_owned),
            line: attrs.optional_parsed("line", u32::from_str)?,
            duration: attrs.optional_parsed("time", parse_duration)?,
            skipped: false,
            blocks: Vec::new(),
        })
    }

    fn finish(mut self) -> Result<TestCaseResult, ParseErrorKind> {
        if self.blocks.len() > 1 {
            return Err(ParseErrorKind::MultipleFailureBlocks {
                test_case: self.name,
                count: self.blocks.len(),
            });
        }
        Ok(TestCaseResult {
            name: self.name,
            classname: self.classname,
            file: self.file,
            line: self.line,
            duration: self.duration,
            skipped: self.skipped,
            failure: self.blocks.pop(),
        })
    }
}

#[derive(Debug)]
struct BlockBuilder {
    kind: FailureKind,
    message: String,
    text: String,
}

impl BlockBuilder {
    fn new(kind: FailureKind, attrs: &Attributes) -> Self {
        Self {
            kind,
            message: attrs.get("message").unwrap_or_default().to_owned(),
            text: String::new(),
        }
    }

    fn finish(self) -> Failure {
        Failure {
            kind: self.kind,
            message: self.message,
            detail_lines: self.text.lines().map(str::to_owned).collect(),
        }
    }
}

/// The unescaped attributes of one element.
struct Attributes {
    element: &'static str,
    values: Vec<(String, String)>,
}

impl Attributes {
    fn collect(
        element: &'static str,
        start: &BytesStart<'_>,
        position: u64,
    ) -> Result<Self, ParseErrorKind> {
        let mut values = Vec::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|err| xml_error(position, err.into()))?;
            let value = attr
                .unescape_value()
                .map_err(|err| xml_error(position, err.into()))?;
            values.push((
                String::from_utf8_lossy(attr.key.as_ref()).into_owned(),
                value.into_owned(),
            ));
        }
        Ok(Self { element, values })
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    fn required(&self, attribute: &'static str) -> Result<&str, ParseErrorKind> {
        self.get(attribute)
            .ok_or(ParseErrorKind::MissingAttribute {
                element: self.element,
                attribute,
            })
    }

    fn required_parsed<T, E: fmt::Display>(
        &self,
        attribute: &'static str,
        parse: impl FnOnce(&str) -> Result<T, E>,
    ) -> Result<T, ParseErrorKind> {
        let value = self.required(attribute)?;
        parse(value).map_err(|err| self.invalid(attribute, value, err))
    }

    fn optional_parsed<T, E: fmt::Display>(
        &self,
        attribute: &'static str,
        parse: impl FnOnce(&str) -> Result<T, E>,
    ) -> Result<Option<T>, ParseErrorKind> {
        self.get(attribute)
            .map(|value| parse(value).map_err(|err| self.invalid(attribute, value, err)))
            .transpose()
    }

    fn invalid(&self, attribute: &'static str, value: &str, err: impl fmt::Display) -> ParseErrorKind {
        ParseErrorKind::InvalidAttribute {
            element: self.element,
            attribute,
            value: value.to_owned(),
            reason: err.to_string(),
        }
    }
}

fn xml_error(position: u64, err: quick_xml::Error) -> ParseErrorKind {
    ParseErrorKind::Xml { position, err }
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    let secs: f64 = value.trim().parse().map_err(|err| format!("{err}"))?;
    Duration::try_from_secs_f64(secs).map_err(|err| err.to_string())
}

/// pytest writes local timestamps without an offset. Those are read as UTC.
fn parse_timestamp(value: &str) -> Result<DateTime<FixedOffset>, String> {
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(value) {
        return Ok(timestamp);
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc().fixed_offset())
        .map_err(|err| err.to_string())
}
