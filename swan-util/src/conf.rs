// Copyright (c) Facebook, Inc. and its affiliates.
//! Process-wide flag registry.
//!
//! Every flag has a name, a help text, a default and a kind. Values are
//! kept as strings which have been validated against the kind. The
//! effective value of a flag is resolved in the order default, restored
//! dump, environment (`SWAN_<NAME>`) and command line; later wins.
use anyhow::{anyhow, bail, Context, Result};
use std::collections::BTreeMap;
use std::fmt::Write as FmtWrite;
use std::marker::PhantomData;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Duration;

use super::{format_go_duration, parse_flag_duration};

pub const ENV_PREFIX: &str = "SWAN_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagKind {
    String,
    Int,
    Bool,
    Duration,
    Slice,
}

/// Semantic hint for string flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringTag {
    None,
    File,
    Ip,
}

impl StringTag {
    fn from_tag(tag: &str) -> Result<Self> {
        match tag {
            "" => Ok(Self::None),
            "file" => Ok(Self::File),
            "ip" => Ok(Self::Ip),
            v => bail!("unknown string type {:?}", v),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlagEntry {
    pub name: String,
    pub help: String,
    pub kind: FlagKind,
    pub tag: StringTag,
    pub default: String,
    pub required: bool,
    value: Option<String>,
}

impl FlagEntry {
    pub fn value(&self) -> &str {
        self.value.as_deref().unwrap_or(&self.default)
    }

    pub fn is_set(&self) -> bool {
        self.value.is_some()
    }

    fn validate(&self, input: &str) -> Result<String> {
        let input = input.trim();
        let normalized = match self.kind {
            FlagKind::String => {
                if self.tag == StringTag::Ip && !input.is_empty() {
                    input
                        .parse::<IpAddr>()
                        .map_err(|e| anyhow!("{:?} is not an IP address ({})", input, e))?;
                }
                input.to_string()
            }
            FlagKind::Int => i64::parse_flag(input)?.format_flag(),
            FlagKind::Bool => bool::parse_flag(input)?.format_flag(),
            FlagKind::Duration => Duration::parse_flag(input)?.format_flag(),
            FlagKind::Slice => Vec::<String>::parse_flag(input)?.format_flag(),
        };
        Ok(normalized)
    }
}

/// Types which can back a flag.
pub trait FlagType: Sized + Default {
    const KIND: FlagKind;
    fn parse_flag(input: &str) -> Result<Self>;
    fn format_flag(&self) -> String;
}

impl FlagType for String {
    const KIND: FlagKind = FlagKind::String;
    fn parse_flag(input: &str) -> Result<Self> {
        Ok(input.to_string())
    }
    fn format_flag(&self) -> String {
        self.clone()
    }
}

impl FlagType for i64 {
    const KIND: FlagKind = FlagKind::Int;
    fn parse_flag(input: &str) -> Result<Self> {
        input
            .trim()
            .parse::<i64>()
            .map_err(|e| anyhow!("{:?} is not an integer ({})", input, e))
    }
    fn format_flag(&self) -> String {
        self.to_string()
    }
}

impl FlagType for bool {
    const KIND: FlagKind = FlagKind::Bool;
    fn parse_flag(input: &str) -> Result<Self> {
        match input.trim().to_lowercase().as_str() {
            "" | "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            v => bail!("{:?} is not a boolean", v),
        }
    }
    fn format_flag(&self) -> String {
        self.to_string()
    }
}

impl FlagType for Duration {
    const KIND: FlagKind = FlagKind::Duration;
    fn parse_flag(input: &str) -> Result<Self> {
        parse_flag_duration(input).map_err(|e| anyhow!("{:?} is not a duration ({})", input, e))
    }
    fn format_flag(&self) -> String {
        format_go_duration(*self)
    }
}

impl FlagType for Vec<String> {
    const KIND: FlagKind = FlagKind::Slice;
    fn parse_flag(input: &str) -> Result<Self> {
        Ok(input
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect())
    }
    fn format_flag(&self) -> String {
        self.join(",")
    }
}

/// Result of command line parsing which the caller has to act upon.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ParsedArgs {
    pub verbosity: u32,
    pub config_dump: bool,
}

#[derive(Debug)]
pub struct Registry {
    env_prefix: String,
    entries: BTreeMap<String, FlagEntry>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(ENV_PREFIX)
    }
}

impl Registry {
    pub fn new(env_prefix: &str) -> Self {
        Self {
            env_prefix: env_prefix.to_string(),
            entries: BTreeMap::new(),
        }
    }

    pub fn env_name(&self, name: &str) -> String {
        format!("{}{}", self.env_prefix, name).to_uppercase()
    }

    /// Registers a flag. Registering the same name again with the same kind
    /// is a no-op so that struct binds can be repeated.
    pub fn register(
        &mut self,
        name: &str,
        kind: FlagKind,
        default: &str,
        help: &str,
        required: bool,
        tag: StringTag,
    ) -> Result<()> {
        if name.is_empty() || name.contains(|c: char| c.is_whitespace() || c == '=') {
            bail!("invalid flag name {:?}", name);
        }
        if let Some(prev) = self.entries.get(name) {
            if prev.kind != kind {
                bail!(
                    "flag {:?} registered twice with kinds {:?} and {:?}",
                    name,
                    prev.kind,
                    kind
                );
            }
            return Ok(());
        }

        let mut entry = FlagEntry {
            name: name.to_string(),
            help: help.to_string(),
            kind,
            tag,
            default: String::new(),
            required,
            value: None,
        };
        entry.default = entry
            .validate(default)
            .with_context(|| format!("invalid default for flag {:?}", name))?;
        self.entries.insert(name.to_string(), entry);
        Ok(())
    }

    pub fn entry(&self, name: &str) -> Option<&FlagEntry> {
        self.entries.get(name)
    }

    pub fn entries(&self) -> impl Iterator<Item = &FlagEntry> {
        self.entries.values()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(|e| e.value())
    }

    pub fn set(&mut self, name: &str, input: &str) -> Result<()> {
        let entry = self
            .entries
            .get_mut(name)
            .ok_or_else(|| anyhow!("unknown flag {:?}", name))?;
        let value = entry
            .validate(input)
            .with_context(|| format!("cannot parse {:?} flag", name))?;
        entry.value = Some(value);
        Ok(())
    }

    /// Applies `<PREFIX><NAME>` variables. All parse errors are collected.
    pub fn parse_env_from<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: BTreeMap<String, String> = vars.into_iter().collect();
        let names: Vec<String> = self.entries.keys().cloned().collect();
        let mut errs = vec![];
        for name in names.iter() {
            if let Some(v) = vars.get(&self.env_name(name)) {
                if v.is_empty() {
                    continue;
                }
                if let Err(e) = self.set(name, v) {
                    errs.push(format!("{:#}", &e));
                }
            }
        }
        if errs.len() > 0 {
            bail!("{}", errs.join("; "));
        }
        Ok(())
    }

    pub fn parse_env(&mut self) -> Result<()> {
        self.parse_env_from(std::env::vars())
    }

    pub fn check_required(&self) -> Result<()> {
        let missing: Vec<&str> = self
            .entries
            .values()
            .filter(|e| e.required && e.value().is_empty())
            .map(|e| e.name.as_str())
            .collect();
        if missing.len() > 0 {
            bail!("required flags not set: {}", missing.join(", "));
        }
        Ok(())
    }

    /// Parses the command line. Environment variables are applied first so
    /// that explicit options override them.
    pub fn parse_args_from<I, T>(&mut self, app_name: &str, args: I) -> Result<ParsedArgs>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let (parsed, config, values) = self.match_args(app_name, args)?;
        if let Some(path) = config {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("cannot load config file {:?}", &path))?;
            self.restore(&text)?;
        }
        self.parse_env()?;
        for (name, value) in values.iter() {
            self.set(name, value)?;
        }
        if !parsed.config_dump {
            self.check_required()?;
        }
        Ok(parsed)
    }

    fn match_args<I, T>(
        &self,
        app_name: &str,
        args: I,
    ) -> Result<(ParsedArgs, Option<String>, Vec<(String, String)>)>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let helps: Vec<(String, String)> = self
            .entries
            .values()
            .map(|e| {
                let mut help = e.help.clone();
                if !e.default.is_empty() {
                    write!(help, " [default: {}]", &e.default).ok();
                }
                if e.required {
                    help += " [required]";
                }
                (e.name.clone(), help)
            })
            .collect();

        let mut app = clap::App::new(app_name)
            .about("Co-located workload sensitivity experiment")
            .setting(clap::AppSettings::UnifiedHelpMessage)
            .setting(clap::AppSettings::DeriveDisplayOrder)
            .arg(
                clap::Arg::with_name("config")
                    .long("config")
                    .takes_value(true)
                    .help("Restore flags from a configuration dump before parsing"),
            )
            .arg(
                clap::Arg::with_name("config-dump")
                    .long("config-dump")
                    .help("Print the effective configuration and exit"),
            )
            .arg(
                clap::Arg::with_name("verbose")
                    .short("v")
                    .multiple(true)
                    .help("Sets the level of verbosity"),
            );

        for (name, help) in helps.iter() {
            let kind = self.entries[name].kind;
            let mut arg = clap::Arg::with_name(name)
                .long(name)
                .takes_value(true)
                .help(help);
            arg = match kind {
                FlagKind::Bool => arg.min_values(0).max_values(1),
                FlagKind::Slice => arg.multiple(true).number_of_values(1),
                _ => arg,
            };
            app = app.arg(arg);
        }

        let matches = match app.get_matches_from_safe(args) {
            Ok(v) => v,
            Err(e) => match e.kind {
                clap::ErrorKind::HelpDisplayed | clap::ErrorKind::VersionDisplayed => e.exit(),
                _ => bail!("{}", e.message),
            },
        };

        let mut values = vec![];
        for (name, _) in helps.iter() {
            if matches.occurrences_of(name) == 0 {
                continue;
            }
            let value = match matches.values_of(name) {
                Some(vals) => vals.collect::<Vec<&str>>().join(","),
                None => String::new(),
            };
            values.push((name.clone(), value));
        }

        Ok((
            ParsedArgs {
                verbosity: matches.occurrences_of("verbose") as u32,
                config_dump: matches.is_present("config-dump"),
            },
            matches.value_of("config").map(|s| s.to_string()),
            values,
        ))
    }

    /// Name to effective value.
    pub fn values(&self) -> BTreeMap<String, String> {
        self.entries
            .values()
            .map(|e| (e.name.clone(), e.value().to_string()))
            .collect()
    }

    /// Emits a `NAME=value` dump which `restore()` accepts. Values present
    /// in `overrides` replace the effective ones.
    pub fn dump_with(&self, overrides: &BTreeMap<String, String>) -> String {
        let mut buf = String::new();
        for e in self.entries.values() {
            write!(buf, "\n# {}\n", &e.help).ok();
            if !e.default.is_empty() {
                write!(buf, "# Default: {}\n", &e.default).ok();
            }
            let value = overrides
                .get(&e.name)
                .map(|v| v.as_str())
                .unwrap_or_else(|| e.value());
            write!(buf, "{}={}\n", e.name.to_uppercase(), value).ok();
        }
        buf
    }

    pub fn dump(&self) -> String {
        self.dump_with(&BTreeMap::new())
    }

    /// Re-applies a dump. Keys may be upper case, lower case or carry the
    /// environment prefix. Unknown keys are ignored with a warning.
    pub fn restore(&mut self, text: &str) -> Result<()> {
        let mut errs = vec![];
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (key, value) = match line.find('=') {
                Some(idx) => (&line[..idx], &line[idx + 1..]),
                None => {
                    errs.push(format!("malformed config line {:?}", line));
                    continue;
                }
            };
            let mut name = key.trim().to_lowercase();
            let prefix = self.env_prefix.to_lowercase();
            if !self.entries.contains_key(&name) && name.starts_with(&prefix) {
                name = name[prefix.len()..].to_string();
            }
            if !self.entries.contains_key(&name) {
                log::warn!("conf: Ignoring unknown flag {:?} in config", key);
                continue;
            }
            if let Err(e) = self.set(&name, value.trim().trim_matches('"')) {
                errs.push(format!("{:#}", &e));
            }
        }
        if errs.len() > 0 {
            bail!("{}", errs.join("; "));
        }
        Ok(())
    }

    /// Registers one flag per tagged field of `data` and then loads the
    /// effective flag values back into it.
    pub fn bind<S: FlagStruct>(&mut self, data: &mut S) -> Result<()> {
        let bound = self.bind_fields(data)?;
        for (field, name) in bound.iter() {
            let value = self.entries[name].value().to_string();
            data.set_field(field, &value)
                .with_context(|| format!("setting field {} from flag {:?}", field, name))?;
        }
        Ok(())
    }

    fn bind_fields<S: FlagStruct>(&mut self, data: &S) -> Result<Vec<(&'static str, String)>> {
        let prefix = data.flag_prefix();
        let mut bound = vec![];
        for desc in S::flag_fields() {
            let tags = parse_struct_tag(desc.tags)
                .with_context(|| format!("malformed tag on field {}", desc.field))?;
            if tags.is_empty() {
                continue;
            }
            let help = match tags.get("help") {
                Some(v) if !v.is_empty() => v.clone(),
                _ => bail!(
                    "required help tag is missing on field {}, cannot bind flags",
                    desc.field
                ),
            };
            let base = tags
                .get("name")
                .cloned()
                .unwrap_or_else(|| desc.field.to_string());
            let name = flag_name_from_field(&format!("{}{}", prefix, base));
            let default = match (tags.get("default"), tags.get("defaultFromField")) {
                (Some(v), _) => v.clone(),
                (None, Some(other)) => data.field_value(other).unwrap_or_default(),
                (None, None) => data.field_value(desc.field).unwrap_or_default(),
            };
            let required = match tags.get("required").map(|s| s.as_str()) {
                None | Some("false") => false,
                Some("true") => true,
                Some(v) => bail!("invalid required tag {:?} on field {}", v, desc.field),
            };
            let tag = StringTag::from_tag(tags.get("type").map(|s| s.as_str()).unwrap_or(""))?;
            if tag != StringTag::None && desc.kind != FlagKind::String {
                bail!("type tag on non-string field {}", desc.field);
            }
            self.register(&name, desc.kind, &default, &help, required, tag)?;
            bound.push((desc.field, name));
        }
        Ok(bound)
    }
}

/// Field description of a struct which can be bound to flags.
#[derive(Debug, Clone)]
pub struct FieldDesc {
    pub field: &'static str,
    pub kind: FlagKind,
    /// Space separated `key:"value"` pairs. Recognized keys are `help`,
    /// `default`, `defaultFromField`, `name`, `required` and `type`.
    pub tags: &'static str,
}

pub trait FlagStruct {
    fn flag_fields() -> Vec<FieldDesc>;

    /// Prepended to every derived flag name.
    fn flag_prefix(&self) -> String {
        String::new()
    }

    /// Current value of the field formatted like a flag value.
    fn field_value(&self, field: &str) -> Option<String>;

    fn set_field(&mut self, field: &str, value: &str) -> Result<()>;
}

/// Parses `key:"value" key2:"value two"`.
pub fn parse_struct_tag(input: &str) -> Result<BTreeMap<String, String>> {
    let mut tags = BTreeMap::new();
    let mut rest = input.trim_start();
    while !rest.is_empty() {
        let colon = rest
            .find(':')
            .ok_or_else(|| anyhow!("missing ':' in {:?}", rest))?;
        let key = &rest[..colon];
        if key.is_empty() || key.contains(|c: char| c.is_whitespace() || c == '"') {
            bail!("invalid tag key {:?}", key);
        }
        rest = &rest[colon + 1..];
        if !rest.starts_with('"') {
            bail!("tag value for {:?} is not quoted", key);
        }
        rest = &rest[1..];
        let mut value = String::new();
        let mut closed = false;
        let mut chars = rest.char_indices();
        while let Some((idx, ch)) = chars.next() {
            match ch {
                '\\' => {
                    if let Some((_, esc)) = chars.next() {
                        value.push(esc);
                    }
                }
                '"' => {
                    rest = &rest[idx + 1..];
                    closed = true;
                    break;
                }
                ch => value.push(ch),
            }
        }
        if !closed {
            bail!("unterminated tag value for {:?}", key);
        }
        tags.insert(key.to_string(), value);
        rest = rest.trim_start();
    }
    Ok(tags)
}

/// `MaxMemory` -> `max_memory`, `HTTPPort` -> `http_port`.
pub fn flag_name_from_field(field: &str) -> String {
    let chars: Vec<char> = field.chars().collect();
    let mut words: Vec<String> = vec![];
    let mut cur = String::new();
    for (i, &ch) in chars.iter().enumerate() {
        if ch == '_' || ch == '-' {
            if !cur.is_empty() {
                words.push(cur.clone());
                cur.clear();
            }
            continue;
        }
        if ch.is_uppercase() && !cur.is_empty() {
            let prev = chars[i - 1];
            let next_lower = chars.get(i + 1).map(|c| c.is_lowercase()).unwrap_or(false);
            if prev.is_lowercase() || prev.is_ascii_digit() || (prev.is_uppercase() && next_lower)
            {
                words.push(cur.clone());
                cur.clear();
            }
        }
        cur.extend(ch.to_lowercase());
    }
    if !cur.is_empty() {
        words.push(cur);
    }
    words.join("_")
}

lazy_static::lazy_static! {
    static ref REGISTRY: Mutex<Registry> = Mutex::new(Registry::default());
}

/// Typed accessor to a flag in the process-wide registry.
#[derive(Debug)]
pub struct Flag<T: FlagType> {
    name: String,
    _marker: PhantomData<T>,
}

impl<T: FlagType> Flag<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> T {
        let reg = REGISTRY.lock().unwrap();
        match reg.get(&self.name) {
            Some(raw) => T::parse_flag(raw).unwrap_or_default(),
            None => T::default(),
        }
    }

    pub fn is_set(&self) -> bool {
        let reg = REGISTRY.lock().unwrap();
        reg.entry(&self.name).map(|e| e.is_set()).unwrap_or(false)
    }

    pub fn set(&self, value: &T) -> Result<()> {
        REGISTRY.lock().unwrap().set(&self.name, &value.format_flag())
    }

    pub fn default_value(&self) -> T {
        let reg = REGISTRY.lock().unwrap();
        match reg.entry(&self.name) {
            Some(e) => T::parse_flag(&e.default).unwrap_or_default(),
            None => T::default(),
        }
    }
}

fn new_flag<T: FlagType>(
    name: &str,
    help: &str,
    default: &str,
    required: bool,
    tag: StringTag,
) -> Flag<T> {
    if let Err(e) = REGISTRY
        .lock()
        .unwrap()
        .register(name, T::KIND, default, help, required, tag)
    {
        panic!("conf: {:#}", &e);
    }
    Flag {
        name: name.to_string(),
        _marker: PhantomData,
    }
}

pub fn string_flag(name: &str, help: &str, default: &str) -> Flag<String> {
    new_flag(name, help, default, false, StringTag::None)
}

pub fn required_string_flag(name: &str, help: &str) -> Flag<String> {
    new_flag(name, help, "", true, StringTag::None)
}

pub fn file_flag(name: &str, help: &str, default: &str) -> Flag<String> {
    new_flag(name, help, default, false, StringTag::File)
}

pub fn ip_flag(name: &str, help: &str, default: &str) -> Flag<String> {
    new_flag(name, help, default, false, StringTag::Ip)
}

pub fn int_flag(name: &str, help: &str, default: i64) -> Flag<i64> {
    new_flag(name, help, &default.to_string(), false, StringTag::None)
}

pub fn bool_flag(name: &str, help: &str, default: bool) -> Flag<bool> {
    new_flag(name, help, &default.to_string(), false, StringTag::None)
}

pub fn duration_flag(name: &str, help: &str, default: Duration) -> Flag<Duration> {
    new_flag(
        name,
        help,
        &format_go_duration(default),
        false,
        StringTag::None,
    )
}

pub fn slice_flag(name: &str, help: &str, default: &[&str]) -> Flag<Vec<String>> {
    new_flag(name, help, &default.join(","), false, StringTag::None)
}

pub fn parse_env() -> Result<()> {
    REGISTRY.lock().unwrap().parse_env()
}

pub fn parse_args<I, T>(app_name: &str, args: I) -> Result<ParsedArgs>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    REGISTRY.lock().unwrap().parse_args_from(app_name, args)
}

pub fn set(name: &str, value: &str) -> Result<()> {
    REGISTRY.lock().unwrap().set(name, value)
}

pub fn values() -> BTreeMap<String, String> {
    REGISTRY.lock().unwrap().values()
}

pub fn dump() -> String {
    REGISTRY.lock().unwrap().dump()
}

pub fn dump_with(overrides: &BTreeMap<String, String>) -> String {
    REGISTRY.lock().unwrap().dump_with(overrides)
}

pub fn restore(text: &str) -> Result<()> {
    REGISTRY.lock().unwrap().restore(text)
}

pub fn bind<S: FlagStruct>(data: &mut S) -> Result<()> {
    REGISTRY.lock().unwrap().bind(data)
}

pub fn env_prefix() -> String {
    REGISTRY.lock().unwrap().env_prefix.clone()
}
