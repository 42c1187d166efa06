//! Reading and writing the configuration file.
//!
//! The file is XML with a `<tiptop>` root: an optional `<options>` block
//! of name/value pairs, then any number of `<screen>` definitions, each
//! holding `<counter>` and `<column>` elements. Counters may be gated on
//! the host architecture and CPU model so one file can serve a fleet of
//! machines with different raw event codes.
//!
//! Loading failures are never fatal: the monitor falls back to its
//! built-in screens. The exporter writes the same format back, resolving
//! numeric event types and codes to their canonical names where they
//! have one, and refuses to clobber an existing file.

use std::env;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use log::debug;
use thiserror::Error;

use crate::errlog::ErrorLog;
use crate::options::Options;
use crate::screen::{self, Screen, ScreenSet};
use crate::target;

/// File name looked up in the usual places.
pub const CONFIG_FILE_NAME: &str = ".perftoprc";

/// Environment variable naming the directory that holds the file.
pub const CONFIG_ENV_VAR: &str = "PERFTOP";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration file: {0}")]
    Io(#[from] io::Error),
    #[error("malformed configuration file: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("root element is <{0}>, expected <tiptop>")]
    BadRoot(String),
}

/// Locate the configuration file. First hit wins: the path given on the
/// command line, the directory in `$PERFTOP`, the current directory,
/// `$HOME`.
pub fn find_config(cli_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = cli_path {
        if p.is_dir() {
            return readable(p.join(CONFIG_FILE_NAME));
        }
        return Some(p.to_path_buf());
    }
    if let Ok(dir) = env::var(CONFIG_ENV_VAR) {
        if let Some(p) = readable(Path::new(&dir).join(CONFIG_FILE_NAME)) {
            return Some(p);
        }
    }
    if let Some(p) = readable(PathBuf::from(CONFIG_FILE_NAME)) {
        return Some(p);
    }
    if let Ok(home) = env::var("HOME") {
        if let Some(p) = readable(Path::new(&home).join(CONFIG_FILE_NAME)) {
            return Some(p);
        }
    }
    None
}

fn readable(p: PathBuf) -> Option<PathBuf> {
    if p.is_file() {
        Some(p)
    } else {
        None
    }
}

/// Parse the file into the option record and the screen set. Per-element
/// problems (a counter without an alias, a column with a bad expression)
/// are diagnosed and skipped; only an unreadable or unparsable document
/// is an error.
pub fn read_config(
    path: &Path,
    options: &mut Options,
    screens: &mut ScreenSet,
    errlog: &mut ErrorLog,
) -> Result<(), ConfigError> {
    let text = fs::read_to_string(path)?;
    let doc = roxmltree::Document::parse(&text)?;
    let root = doc.root_element();
    if root.tag_name().name() != "tiptop" {
        return Err(ConfigError::BadRoot(root.tag_name().name().to_string()));
    }

    for node in root.children().filter(|n| n.is_element()) {
        match node.tag_name().name() {
            "options" => {
                for opt in node.children().filter(|n| n.is_element()) {
                    if opt.tag_name().name() != "option" {
                        continue;
                    }
                    if let (Some(name), Some(value)) =
                        (opt.attribute("name"), opt.attribute("value"))
                    {
                        option_update(name, value, options);
                    }
                }
            }
            "screen" => parse_screen(node, screens, errlog),
            other => debug!("ignoring configuration element <{}>", other),
        }
    }
    Ok(())
}

/// Apply one option pair. Most booleans OR with what the command line
/// will toggle; the display-state ones assign directly.
fn option_update(name: &str, value: &str, opt: &mut Options) {
    let as_bool = || value.trim().parse::<i64>().map(|v| v != 0).unwrap_or(false);
    match name {
        "delay" => {
            if let Ok(v) = value.trim().parse() {
                opt.delay = v;
            }
        }
        "cpu_threshold" => {
            if let Ok(v) = value.trim().parse() {
                opt.cpu_threshold = v;
            }
        }
        "batch" => opt.batch = opt.batch || as_bool(),
        "show_cmdline" => opt.show_cmdline = opt.show_cmdline || as_bool(),
        "show_epoch" => opt.show_epoch = opt.show_epoch || as_bool(),
        "show_kernel" => opt.show_kernel = opt.show_kernel || as_bool(),
        "debug" => opt.debug = opt.debug || as_bool(),
        "show_timestamp" => opt.show_timestamp = opt.show_timestamp || as_bool(),
        "show_user" => opt.show_user = as_bool(),
        "show_threads" => opt.show_threads = as_bool(),
        "idle" => opt.idle = as_bool(),
        "sticky" => opt.sticky = as_bool(),
        "watch_uid" => opt.watch_uid = value.trim().parse().ok(),
        "max_iter" => opt.max_iter = value.trim().parse().unwrap_or(0),
        "watch_name" => {
            if !value.is_empty() {
                opt.watch_name = Some(value.to_string());
            }
        }
        "only_name" => {
            if !value.is_empty() {
                opt.only_name = Some(value.to_string());
            }
        }
        "only_pid" => {
            opt.only_pid = value.trim().parse().ok().filter(|p| *p != 0);
        }
        other => debug!("unknown option '{}' ignored", other),
    }
}

fn parse_screen(node: roxmltree::Node, screens: &mut ScreenSet, errlog: &mut ErrorLog) {
    let name = match node.attribute("name") {
        Some(n) if !n.is_empty() => n,
        _ => "(no name)",
    };
    let idx = screens.new_screen(name, node.attribute("desc"), false);

    for child in node.children().filter(|n| n.is_element()) {
        let s = screens.get_mut(idx).unwrap();
        match child.tag_name().name() {
            "counter" => parse_counter(s, child, errlog),
            "column" => parse_column(s, child, errlog),
            _ => {}
        }
    }
}

fn parse_counter(s: &mut Screen, node: roxmltree::Node, errlog: &mut ErrorLog) {
    let alias = match node.attribute("alias") {
        Some(a) => a,
        None => {
            // Without an alias the counter cannot be referenced, hence useless.
            errlog.record(format!("Need an alias for a counter in screen '{}'", s.name));
            return;
        }
    };
    let config = match node.attribute("config") {
        Some(c) => c,
        None => {
            errlog.record(format!(
                "Need a config for counter '{}' in screen '{}'",
                alias, s.name
            ));
            return;
        }
    };
    if let Some(arch) = node.attribute("arch") {
        if !target::match_target(arch) {
            errlog.record(format!(
                "Skipping counter '{}' in screen '{}' (arch mismatch)",
                alias, s.name
            ));
            return;
        }
    }
    if let Some(model) = node.attribute("model") {
        if !target::match_model(model) {
            errlog.record(format!(
                "Skipping counter '{}' in screen '{}' (model mismatch)",
                alias, s.name
            ));
            return;
        }
    }
    s.add_counter(alias, config, node.attribute("type"), errlog);
}

fn parse_column(s: &mut Screen, node: roxmltree::Node, errlog: &mut ErrorLog) {
    let header = match node.attribute("header") {
        Some(h) if !h.is_empty() => h,
        _ => {
            errlog.record(format!("Need a header for a column in screen '{}'", s.name));
            return;
        }
    };
    let format = match node.attribute("format") {
        Some(f) if !f.is_empty() => f,
        _ => {
            errlog.record(format!(
                "Need a format for column '{}' in screen '{}'",
                header, s.name
            ));
            return;
        }
    };
    let expr = match node.attribute("expr") {
        Some(e) => e,
        None => {
            errlog.record(format!(
                "Need an expression for column '{}' in screen '{}'",
                header, s.name
            ));
            return;
        }
    };
    s.add_column(header, format, node.attribute("desc"), expr, errlog);
}

const INTRO: &str = "\
<!-- perftop configuration file -->\n\
\n\
<!-- Rename this file to .perftoprc, and place it either in your        -->\n\
<!-- current directory, the location specified in $PERFTOP, or in       -->\n\
<!-- your $HOME.                                                        -->\n";

/// Export the current screens and options into `.perftoprc` in the
/// current directory. Never overwrites an existing file.
pub fn export(screens: &ScreenSet, options: &Options) -> io::Result<PathBuf> {
    export_to(Path::new("."), screens, options)
}

pub fn export_to(dir: &Path, screens: &ScreenSet, options: &Options) -> io::Result<PathBuf> {
    let path = dir.join(CONFIG_FILE_NAME);
    if path.exists() {
        return Err(io::Error::new(
            ErrorKind::AlreadyExists,
            format!("'{}' already exists", path.display()),
        ));
    }

    let mut out = String::new();
    out.push_str(INTRO);
    out.push_str("\n<tiptop>\n");
    dump_options(&mut out, options);
    for s in screens.iter() {
        dump_screen(&mut out, s);
    }
    out.push_str("</tiptop>\n");

    fs::write(&path, out)?;
    Ok(path)
}

fn dump_option(out: &mut String, name: &str, value: &str) {
    out.push_str(&format!(
        "\t\t<option name=\"{}\" value=\"{}\" />\n",
        name,
        escape(value)
    ));
}

/// Option order is fixed so that exported files diff cleanly.
fn dump_options(out: &mut String, o: &Options) {
    out.push_str("\t<options>\n");
    dump_option(out, "cpu_threshold", &format!("{:.6}", o.cpu_threshold));
    dump_option(out, "delay", &format!("{:.6}", o.delay));
    if let Some(name) = &o.watch_name {
        dump_option(out, "watch_name", name);
    }
    dump_option(out, "max_iter", &o.max_iter.to_string());
    if let Some(name) = &o.only_name {
        dump_option(out, "only_name", name);
    }
    dump_option(out, "only_pid", &o.only_pid.unwrap_or(0).to_string());
    dump_option(out, "debug", if o.debug { "1" } else { "0" });
    dump_option(out, "batch", if o.batch { "1" } else { "0" });
    out.push_str("\t</options>\n");
}

fn dump_screen(out: &mut String, s: &Screen) {
    out.push_str(&format!(
        "\t<screen name=\"{}\" desc=\"{}\">\n",
        escape(&s.name),
        escape(&s.desc)
    ));
    for c in &s.counters {
        let config = match screen::counter_config_name(c.config) {
            Some(name) => name.to_string(),
            None => format!("0x{:x}", c.config),
        };
        let kind = match screen::counter_kind_name(c.kind) {
            Some(name) => name.to_string(),
            None => format!("0x{:x}", c.kind),
        };
        out.push_str(&format!(
            "\t\t<counter alias=\"{}\" config=\"{}\" type=\"{}\" />\n",
            escape(&c.alias),
            config,
            kind
        ));
    }
    for col in &s.columns {
        out.push_str(&format!(
            "\t\t<column header=\"{}\" format=\"{}\" desc=\"{}\" expr=\"{}\" />\n",
            escape(&col.header),
            escape(&col.format),
            escape(&col.description),
            escape(&col.expr.to_string())
        ));
    }
    out.push_str("\t</screen>\n");
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::screen::builtin_screens;

    fn parse_str(text: &str) -> (Options, ScreenSet, ErrorLog) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, text).unwrap();
        let mut options = Options::default();
        let mut screens = ScreenSet::new();
        let mut errlog = ErrorLog::new();
        read_config(&path, &mut options, &mut screens, &mut errlog).unwrap();
        (options, screens, errlog)
    }

    #[test]
    fn parses_options_and_screens() {
        let (options, screens, errlog) = parse_str(
            r#"<tiptop>
                 <options>
                   <option name="delay" value="0.5" />
                   <option name="show_threads" value="1" />
                   <option name="watch_name" value="cc1" />
                 </options>
                 <screen name="mine" desc="test screen">
                   <counter alias="C" config="CPU_CYCLES" type="HARDWARE" />
                   <counter alias="I" config="INSTRUCTIONS" />
                   <column header="  IPC" format=" %4.2f" desc="ipc" expr="delta(I)/delta(C)" />
                 </screen>
               </tiptop>"#,
        );
        assert_eq!(errlog.count(), 0);
        assert_eq!(options.delay, 0.5);
        assert!(options.show_threads);
        assert_eq!(options.watch_name.as_deref(), Some("cc1"));

        assert_eq!(screens.len(), 1);
        let s = screens.get(0).unwrap();
        assert_eq!(s.name, "mine");
        assert_eq!(s.desc, "test screen");
        assert_eq!(s.counters.len(), 2);
        assert_eq!(s.counters[1].kind, 0); // HARDWARE is the default
        assert_eq!(s.columns.len(), 1);
        assert_eq!(s.counters[0].used, 1);
        assert_eq!(s.counters[1].used, 1);
    }

    #[test]
    fn boolean_options_or_with_existing_state() {
        let text = r#"<tiptop><options>
                        <option name="batch" value="0" />
                        <option name="debug" value="1" />
                        <option name="idle" value="0" />
                      </options></tiptop>"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, text).unwrap();

        let mut options = Options::default();
        options.batch = true; // value="0" must not clear it
        options.idle = true; // assigned directly: cleared
        let mut screens = ScreenSet::new();
        let mut errlog = ErrorLog::new();
        read_config(&path, &mut options, &mut screens, &mut errlog).unwrap();
        assert!(options.batch);
        assert!(options.debug);
        assert!(!options.idle);
    }

    #[test]
    fn arch_gated_counters_are_skipped() {
        let (_, screens, errlog) = parse_str(
            r#"<tiptop>
                 <screen name="gated">
                   <counter alias="RAW1" config="0x1234" type="RAW" arch="vax" />
                   <column header=" R" format="%2.0f" expr="delta(RAW1)" />
                 </screen>
               </tiptop>"#,
        );
        let s = screens.get(0).unwrap();
        assert!(s.counters.is_empty());
        // The column referencing the skipped counter is rejected too.
        assert!(s.columns.is_empty());
        assert_eq!(errlog.count(), 2);
        assert!(errlog.lines().any(|l| l.contains("arch mismatch")));
    }

    #[test]
    fn incomplete_elements_are_diagnosed() {
        let (_, screens, errlog) = parse_str(
            r#"<tiptop>
                 <screen name="broken">
                   <counter config="CPU_CYCLES" />
                   <column header=" X" format="%2.0f" />
                 </screen>
               </tiptop>"#,
        );
        assert_eq!(screens.get(0).unwrap().counters.len(), 0);
        assert_eq!(screens.get(0).unwrap().columns.len(), 0);
        assert_eq!(errlog.count(), 2);
    }

    #[test]
    fn malformed_or_misrooted_documents_fail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let mut options = Options::default();
        let mut screens = ScreenSet::new();
        let mut errlog = ErrorLog::new();

        fs::write(&path, "<tiptop><broken").unwrap();
        assert!(matches!(
            read_config(&path, &mut options, &mut screens, &mut errlog),
            Err(ConfigError::Xml(_))
        ));

        fs::write(&path, "<toptip></toptip>").unwrap();
        assert!(matches!(
            read_config(&path, &mut options, &mut screens, &mut errlog),
            Err(ConfigError::BadRoot(_))
        ));
    }

    #[test]
    fn export_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let screens = ScreenSet::new();
        let options = Options::default();
        export_to(dir.path(), &screens, &options).unwrap();
        let err = export_to(dir.path(), &screens, &options).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn export_then_import_round_trips() {
        let mut errlog = ErrorLog::new();
        let mut screens = ScreenSet::new();
        builtin_screens(&mut screens, &mut errlog);

        let mut options = Options::default();
        options.delay = 1.5;
        options.cpu_threshold = 2.25;
        options.max_iter = 7;
        options.only_name = Some("cc1".into());
        options.watch_name = Some("a<b&c".into());
        options.debug = true;

        let dir = tempfile::tempdir().unwrap();
        let path = export_to(dir.path(), &screens, &options).unwrap();

        let mut options2 = Options::default();
        let mut screens2 = ScreenSet::new();
        let mut errlog2 = ErrorLog::new();
        read_config(&path, &mut options2, &mut screens2, &mut errlog2).unwrap();
        assert_eq!(errlog2.count(), 0);

        assert_eq!(options2.delay, 1.5);
        assert_eq!(options2.cpu_threshold, 2.25);
        assert_eq!(options2.max_iter, 7);
        assert_eq!(options2.only_name.as_deref(), Some("cc1"));
        assert_eq!(options2.watch_name.as_deref(), Some("a<b&c"));
        assert!(options2.debug);

        assert_eq!(screens2.len(), screens.len());
        for (a, b) in screens.iter().zip(screens2.iter()) {
            assert_eq!(a.name, b.name);
            assert_eq!(a.desc, b.desc);
            assert_eq!(a.counters.len(), b.counters.len());
            for (ca, cb) in a.counters.iter().zip(b.counters.iter()) {
                assert_eq!(ca.alias, cb.alias);
                assert_eq!(ca.kind, cb.kind);
                assert_eq!(ca.config, cb.config);
            }
            assert_eq!(a.columns.len(), b.columns.len());
            for (ca, cb) in a.columns.iter().zip(b.columns.iter()) {
                assert_eq!(ca.header, cb.header);
                assert_eq!(ca.format, cb.format);
                assert_eq!(ca.description, cb.description);
                assert_eq!(ca.expr, cb.expr);
                assert_eq!(ca.empty_field, cb.empty_field);
            }
        }
    }

    #[test]
    fn find_config_prefers_the_cli_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("custom.xml");
        fs::write(&file, "<tiptop></tiptop>").unwrap();
        assert_eq!(find_config(Some(&file)), Some(file.clone()));

        // A directory is searched for the default file name.
        assert_eq!(find_config(Some(dir.path())), None);
        let rc = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&rc, "<tiptop></tiptop>").unwrap();
        assert_eq!(find_config(Some(dir.path())), Some(rc));
    }
}
