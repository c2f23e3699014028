//! JUnit XML reports: parsing per-package reports and writing the merged one.
//!
//! `gotestsum --junitfile` produces one document per package:
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites tests="2" failures="1" errors="0" time="12.034">
//!   <testsuite tests="2" failures="1" time="12.034" name="github.com/elastic/beats/v7/testing/integration">
//!     <properties>
//!       <property name="go.version" value="go1.22.6 linux/amd64"></property>
//!     </properties>
//!     <testcase classname="github.com/elastic/beats/v7/testing/integration" name="TestA" time="4.100"></testcase>
//!     <testcase classname="github.com/elastic/beats/v7/testing/integration" name="TestB" time="7.934">
//!       <failure message="Failed" type="">=== RUN   TestB ...</failure>
//!     </testcase>
//!   </testsuite>
//! </testsuites>
//! ```
//!
//! Parsing goes through the `quick-xml` serde support; writing uses the event
//! writer so the merged document keeps the same shape.

use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use serde::Deserialize;

/// A whole JUnit document.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct JUnitTestSuites {
    #[serde(rename = "testsuite", default)]
    pub suites: Vec<JUnitTestSuite>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct JUnitTestSuite {
    #[serde(rename = "@name", default)]
    pub name: String,

    #[serde(rename = "@tests", default)]
    pub tests: u64,

    #[serde(rename = "@failures", default)]
    pub failures: u64,

    #[serde(rename = "@errors", default)]
    pub errors: u64,

    #[serde(rename = "@time", default)]
    pub time: String,

    #[serde(rename = "@timestamp", default)]
    pub timestamp: Option<String>,

    #[serde(default)]
    pub properties: JUnitProperties,

    #[serde(rename = "testcase", default)]
    pub test_cases: Vec<JUnitTestCase>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct JUnitProperties {
    #[serde(rename = "property", default)]
    pub properties: Vec<JUnitProperty>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JUnitProperty {
    #[serde(rename = "@name")]
    pub name: String,

    #[serde(rename = "@value", default)]
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct JUnitTestCase {
    #[serde(rename = "@classname", default)]
    pub classname: String,

    #[serde(rename = "@name", default)]
    pub name: String,

    #[serde(rename = "@time", default)]
    pub time: String,

    #[serde(default)]
    pub failure: Option<JUnitMessage>,

    #[serde(default)]
    pub error: Option<JUnitMessage>,

    #[serde(default)]
    pub skipped: Option<JUnitMessage>,

    #[serde(rename = "system-out", default)]
    pub system_out: Option<String>,
}

/// Body of a `<failure>`, `<error>` or `<skipped>` element.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct JUnitMessage {
    #[serde(rename = "@message", default)]
    pub message: String,

    #[serde(rename = "@type", default)]
    pub kind: String,

    #[serde(rename = "$text", default)]
    pub contents: String,
}

impl JUnitTestSuites {
    pub fn tests(&self) -> u64 {
        self.suites.iter().map(|s| s.tests).sum()
    }

    pub fn failures(&self) -> u64 {
        self.suites.iter().map(|s| s.failures).sum()
    }

    pub fn errors(&self) -> u64 {
        self.suites.iter().map(|s| s.errors).sum()
    }
}

/// Parses a JUnit document. Empty input is an empty document.
pub fn parse_junit(data: &[u8]) -> Result<JUnitTestSuites, quick_xml::DeError> {
    let text = String::from_utf8_lossy(data);
    if text.trim().is_empty() {
        return Ok(JUnitTestSuites::default());
    }
    quick_xml::de::from_str(&text)
}

/// Serializes the merged document.
pub fn write_junit(suites: &JUnitTestSuites) -> anyhow::Result<Vec<u8>> {
    let mut writer = Writer::new_with_indent(Vec::new(), b'\t', 1);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let mut root = BytesStart::new("testsuites");
    root.push_attribute(("tests", suites.tests().to_string().as_str()));
    root.push_attribute(("failures", suites.failures().to_string().as_str()));
    root.push_attribute(("errors", suites.errors().to_string().as_str()));
    writer.write_event(Event::Start(root))?;

    for suite in &suites.suites {
        write_suite(&mut writer, suite)?;
    }

    writer.write_event(Event::End(BytesEnd::new("testsuites")))?;
    Ok(writer.into_inner())
}

fn write_suite<W: std::io::Write>(
    writer: &mut Writer<W>,
    suite: &JUnitTestSuite,
) -> anyhow::Result<()> {
    let mut start = BytesStart::new("testsuite");
    start.push_attribute(("tests", suite.tests.to_string().as_str()));
    start.push_attribute(("failures", suite.failures.to_string().as_str()));
    start.push_attribute(("errors", suite.errors.to_string().as_str()));
    start.push_attribute(("time", suite.time.as_str()));
    start.push_attribute(("name", suite.name.as_str()));
    if let Some(ts) = &suite.timestamp {
        start.push_attribute(("timestamp", ts.as_str()));
    }
    writer.write_event(Event::Start(start))?;

    if !suite.properties.properties.is_empty() {
        writer.write_event(Event::Start(BytesStart::new("properties")))?;
        for prop in &suite.properties.properties {
            let mut p = BytesStart::new("property");
            p.push_attribute(("name", prop.name.as_str()));
            p.push_attribute(("value", prop.value.as_str()));
            writer.write_event(Event::Empty(p))?;
        }
        writer.write_event(Event::End(BytesEnd::new("properties")))?;
    }

    for case in &suite.test_cases {
        let mut start = BytesStart::new("testcase");
        start.push_attribute(("classname", case.classname.as_str()));
        start.push_attribute(("name", case.name.as_str()));
        start.push_attribute(("time", case.time.as_str()));

        let children = [
            ("failure", &case.failure),
            ("error", &case.error),
            ("skipped", &case.skipped),
        ];
        if children.iter().all(|(_, c)| c.is_none()) && case.system_out.is_none() {
            writer.write_event(Event::Empty(start))?;
            continue;
        }

        writer.write_event(Event::Start(start))?;
        for (tag, child) in children {
            if let Some(msg) = child {
                let mut el = BytesStart::new(tag);
                el.push_attribute(("message", strip_invalid(&msg.message).as_str()));
                el.push_attribute(("type", msg.kind.as_str()));
                writer.write_event(Event::Start(el))?;
                writer.write_event(Event::Text(BytesText::new(&strip_invalid(&msg.contents))))?;
                writer.write_event(Event::End(BytesEnd::new(tag)))?;
            }
        }
        if let Some(out) = &case.system_out {
            writer.write_event(Event::Start(BytesStart::new("system-out")))?;
            writer.write_event(Event::Text(BytesText::new(&strip_invalid(out))))?;
            writer.write_event(Event::End(BytesEnd::new("system-out")))?;
        }
        writer.write_event(Event::End(BytesEnd::new("testcase")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
    Ok(())
}

/// Drops characters XML 1.0 cannot carry (test output may contain them).
fn strip_invalid(s: &str) -> String {
    s.chars()
        .filter(|c| {
            matches!(
                c,
                '\t' | '\n' | '\r' | ' '..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}' | '\u{10000}'..='\u{10FFFF}'
            )
        })
        .collect()
}
