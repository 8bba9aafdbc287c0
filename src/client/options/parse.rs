use std::{path::PathBuf, time::Duration};

use strsim::jaro_winkler;

use super::{ClientOptions, ServerAddress, Tls, TlsOptions};
use crate::{
    bson::Document,
    client::auth::Credential,
    concern::{Acknowledgment, WriteConcern},
    error::{Error, ErrorKind, Result},
    sdam::MIN_HEARTBEAT_FREQUENCY,
    selection_criteria::{ReadPreference, SelectionCriteria, TagSet},
};

const URI_OPTIONS: &[&str] = &[
    "appname",
    "authmechanism",
    "authmechanismproperties",
    "authsource",
    "connecttimeoutms",
    "directconnection",
    "heartbeatfrequencyms",
    "journal",
    "localthresholdms",
    "maxconnecting",
    "maxidletimems",
    "maxstalenessseconds",
    "maxpoolsize",
    "minpoolsize",
    "readpreference",
    "readpreferencetags",
    "replicaset",
    "retryreads",
    "retrywrites",
    "serverselectiontimeoutms",
    "sockettimeoutms",
    "ssl",
    "tls",
    "tlscafile",
    "w",
    "waitqueuetimeoutms",
    "wtimeoutms",
];

/// Reserved characters as defined by [Section 2.2 of RFC-3986](https://tools.ietf.org/html/rfc3986#section-2.2).
/// Usernames / passwords that contain these characters must instead include the URL encoded
/// version of them when included as part of the connection string.
const USERINFO_RESERVED_CHARACTERS: &[char] = &[':', '/', '?', '#', '[', ']', '@'];

const ILLEGAL_DATABASE_CHARACTERS: &[char] = &['/', '\\', ' ', '"', '$'];

/// The intermediate state of a connection string while its options are being read.
#[derive(Debug, Default)]
pub(super) struct ClientOptionsParser {
    hosts: Vec<ServerAddress>,
    app_name: Option<String>,
    tls: Option<Tls>,
    heartbeat_freq: Option<Duration>,
    local_threshold: Option<Duration>,
    selection_criteria: Option<SelectionCriteria>,
    repl_set_name: Option<String>,
    write_concern: Option<WriteConcern>,
    max_pool_size: Option<u32>,
    min_pool_size: Option<u32>,
    max_connecting: Option<u32>,
    max_idle_time: Option<Duration>,
    wait_queue_timeout: Option<Duration>,
    server_selection_timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
    retry_reads: Option<bool>,
    retry_writes: Option<bool>,
    socket_timeout: Option<Duration>,
    direct_connection: Option<bool>,
    credential: Option<Credential>,
    default_database: Option<String>,
    auth_source: Option<String>,
    auth_mechanism: Option<String>,
    auth_mechanism_properties: Option<Document>,
    read_preference: Option<ReadPreference>,
    read_preference_tags: Option<Vec<TagSet>>,
    max_staleness: Option<Duration>,
}

impl From<ClientOptionsParser> for ClientOptions {
    fn from(parser: ClientOptionsParser) -> Self {
        let mut options = Self::builder()
            .hosts(parser.hosts)
            .app_name(parser.app_name)
            .tls(parser.tls)
            .heartbeat_freq(parser.heartbeat_freq)
            .local_threshold(parser.local_threshold)
            .selection_criteria(parser.selection_criteria)
            .repl_set_name(parser.repl_set_name)
            .write_concern(parser.write_concern)
            .max_pool_size(parser.max_pool_size)
            .min_pool_size(parser.min_pool_size)
            .max_connecting(parser.max_connecting)
            .max_idle_time(parser.max_idle_time)
            .wait_queue_timeout(parser.wait_queue_timeout)
            .server_selection_timeout(parser.server_selection_timeout)
            .connect_timeout(parser.connect_timeout)
            .retry_reads(parser.retry_reads)
            .retry_writes(parser.retry_writes)
            .socket_timeout(parser.socket_timeout)
            .direct_connection(parser.direct_connection)
            .credential(parser.credential)
            .build();
        options.default_database = parser.default_database;
        options
    }
}

/// Splits a string into a section before a given index and a section exclusively after the index.
/// Empty portions are returned as `None`.
fn exclusive_split_at(s: &str, i: usize) -> (Option<&str>, Option<&str>) {
    let (l, r) = s.split_at(i);

    let lout = if !l.is_empty() { Some(l) } else { None };
    let rout = if r.len() > 1 { Some(&r[1..]) } else { None };

    (lout, rout)
}

fn percent_decode(s: &str, err_message: &str) -> Result<String> {
    match percent_encoding::percent_decode_str(s).decode_utf8() {
        Ok(result) => Ok(result.to_string()),
        Err(_) => Err(Error::invalid_argument(err_message)),
    }
}

fn validate_userinfo(s: &str, userinfo_type: &str) -> Result<()> {
    if s.chars().any(|c| USERINFO_RESERVED_CHARACTERS.contains(&c)) {
        return Err(Error::invalid_argument(format!(
            "{} must be URL encoded",
            userinfo_type
        )));
    }

    // All instances of '%' must be followed by two hexadecimal digits.
    if s.split('%')
        .skip(1)
        .any(|part| part.len() < 2 || part[0..2].chars().any(|c| !c.is_ascii_hexdigit()))
    {
        return Err(Error::invalid_argument(
            "username/password cannot contain unescaped %",
        ));
    }

    Ok(())
}

impl ClientOptionsParser {
    pub(super) fn parse(s: &str) -> Result<Self> {
        let Some(end_of_scheme) = s.find("://") else {
            return Err(Error::invalid_argument("connection string contains no scheme"));
        };

        match &s[..end_of_scheme] {
            "mongodb" => {}
            "mongodb+srv" => {
                return Err(Error::invalid_argument(
                    "'mongodb+srv' connection strings are not supported",
                ))
            }
            other => {
                return Err(Error::invalid_argument(format!(
                    "invalid connection string scheme: {}",
                    other
                )))
            }
        };

        let after_scheme = &s[end_of_scheme + 3..];

        let (pre_slash, post_slash) = match after_scheme.find('/') {
            Some(slash_index) => match exclusive_split_at(after_scheme, slash_index) {
                (Some(section), o) => (section, o),
                (None, _) => return Err(Error::invalid_argument("missing hosts")),
            },
            None => {
                if after_scheme.find('?').is_some() {
                    return Err(Error::invalid_argument(
                        "Missing delimiting slash between hosts and options",
                    ));
                }
                (after_scheme, None)
            }
        };

        let (database, options_section) = match post_slash {
            Some(section) => match section.find('?') {
                Some(index) => exclusive_split_at(section, index),
                None => (post_slash, None),
            },
            None => (None, None),
        };

        let db = match database {
            Some(db) => {
                let decoded = percent_decode(db, "database name must be URL encoded")?;
                if decoded
                    .chars()
                    .any(|c| ILLEGAL_DATABASE_CHARACTERS.contains(&c))
                {
                    return Err(Error::invalid_argument("illegal character in database name"));
                }
                Some(decoded)
            }
            None => None,
        };

        let (authentication_requested, cred_section, hosts_section) = match pre_slash.rfind('@') {
            Some(index) => {
                // An '@' in the host section is a request for authentication, even if the
                // credentials are empty.
                let (creds, hosts) = exclusive_split_at(pre_slash, index);
                match hosts {
                    Some(hs) => (true, creds, hs),
                    None => return Err(Error::invalid_argument("missing hosts")),
                }
            }
            None => (false, None, pre_slash),
        };

        let (username, password) = match cred_section {
            Some(creds) => match creds.find(':') {
                Some(index) => match exclusive_split_at(creds, index) {
                    (username, None) => (username, Some("")),
                    (username, password) => (username, password),
                },
                None => (Some(creds), None),
            },
            None => (None, None),
        };

        let hosts = hosts_section
            .split(',')
            .map(|host| {
                let decoded = percent_decode(host, "host must be URL encoded")?;
                ServerAddress::parse(decoded)
            })
            .collect::<Result<Vec<_>>>()?;

        let mut options = ClientOptionsParser {
            hosts,
            ..Default::default()
        };

        if let Some(opts) = options_section {
            options.parse_options(opts)?;
        }

        if let Some(u) = username {
            let credential = options.credential.get_or_insert_with(Default::default);
            validate_userinfo(u, "username")?;
            credential.username = Some(percent_decode(u, "username must be URL encoded")?);

            if let Some(pass) = password {
                validate_userinfo(pass, "password")?;
                credential.password = Some(percent_decode(pass, "password must be URL encoded")?);
            }
        }

        if options.auth_source.as_deref() == Some("") {
            return Err(Error::invalid_argument("empty authSource provided"));
        }

        if options.auth_mechanism.is_some() || options.auth_mechanism_properties.is_some() {
            options.credential.get_or_insert_with(Default::default);
        }

        match options.credential {
            Some(ref mut credential) => {
                // authSource, then the connection string database, then "admin".
                credential.source = options
                    .auth_source
                    .clone()
                    .or_else(|| db.clone())
                    .or_else(|| Some("admin".into()));
                credential.mechanism = options.auth_mechanism.take();
                credential.mechanism_properties = options.auth_mechanism_properties.take();
            }
            None if authentication_requested => {
                return Err(Error::invalid_argument(
                    "username and mechanism both not provided, but authentication was requested",
                ));
            }
            None => {}
        }

        options.default_database = db;

        Ok(options)
    }

    fn parse_options(&mut self, options: &str) -> Result<()> {
        if options.is_empty() {
            return Ok(());
        }

        let mut keys: Vec<String> = Vec::new();

        for option_pair in options.split('&') {
            let Some((key, value)) = option_pair.split_once('=') else {
                return Err(Error::invalid_argument(format!(
                    "connection string options is not a `key=value` pair: {}",
                    option_pair,
                )));
            };

            let key = key.to_lowercase();
            if key != "readpreferencetags" && keys.contains(&key) {
                return Err(Error::invalid_argument(
                    "repeated options are not allowed in the connection string",
                ));
            }

            let value = percent_decode(value, "connection string option values must be URL encoded")?;
            self.parse_option_pair(&key, &value)?;
            keys.push(key);
        }

        if let Some(tags) = self.read_preference_tags.take() {
            self.read_preference = match self.read_preference.take() {
                Some(read_pref) => Some(read_pref.with_tags(tags)?),
                None => {
                    return Err(Error::invalid_argument(
                        "cannot set read preference tags without also setting read preference \
                         mode",
                    ))
                }
            };
        }

        if let Some(max_staleness) = self.max_staleness.take() {
            self.read_preference = match self.read_preference.take() {
                Some(read_pref) => Some(read_pref.with_max_staleness(max_staleness)?),
                None => {
                    return Err(Error::invalid_argument(
                        "cannot set max staleness without also setting read preference mode",
                    ))
                }
            };
        }

        self.selection_criteria = self.read_preference.take().map(Into::into);

        Ok(())
    }

    fn parse_option_pair(&mut self, key: &str, value: &str) -> Result<()> {
        macro_rules! get_bool {
            ($value:expr, $option:expr) => {
                match $value {
                    "true" => true,
                    "false" => false,
                    _ => {
                        return Err(Error::invalid_argument(format!(
                            "connection string `{}` option must be a boolean",
                            $option,
                        )))
                    }
                }
            };
        }

        macro_rules! get_duration {
            ($value:expr, $option:expr) => {
                match $value.parse::<u64>() {
                    Ok(i) => i,
                    _ => {
                        return Err(Error::invalid_argument(format!(
                            "connection string `{}` option must be a non-negative integer",
                            $option
                        )))
                    }
                }
            };
        }

        macro_rules! get_u32 {
            ($value:expr, $option:expr) => {
                match $value.parse::<u32>() {
                    Ok(u) => u,
                    Err(_) => {
                        return Err(Error::invalid_argument(format!(
                            "connection string `{}` argument must be a positive integer",
                            $option,
                        )))
                    }
                }
            };
        }

        match key {
            "appname" => {
                self.app_name = Some(value.into());
            }
            "authmechanism" => {
                self.auth_mechanism = Some(value.to_string());
            }
            "authsource" => self.auth_source = Some(value.to_string()),
            "authmechanismproperties" => {
                let mut doc = Document::new();
                let err_func = || Error::invalid_argument("improperly formatted authMechanismProperties");

                for kvp in value.split(',') {
                    match kvp.find(':') {
                        Some(index) => {
                            let (k, v) = exclusive_split_at(kvp, index);
                            let key = k.ok_or_else(err_func)?;
                            let value = v.ok_or_else(err_func)?;
                            doc.insert(key, value);
                        }
                        None => return Err(err_func()),
                    };
                }
                self.auth_mechanism_properties = Some(doc);
            }
            k @ "connecttimeoutms" => {
                self.connect_timeout = Some(Duration::from_millis(get_duration!(value, k)));
            }
            k @ "directconnection" => {
                self.direct_connection = Some(get_bool!(value, k));
            }
            k @ "heartbeatfrequencyms" => {
                let duration = get_duration!(value, k);

                if duration < MIN_HEARTBEAT_FREQUENCY.as_millis() as u64 {
                    return Err(Error::invalid_argument(format!(
                        "'heartbeatFrequencyMS' must be at least {}, but {} was given",
                        MIN_HEARTBEAT_FREQUENCY.as_millis(),
                        duration
                    )));
                }

                self.heartbeat_freq = Some(Duration::from_millis(duration));
            }
            k @ "journal" => {
                let write_concern = self.write_concern.get_or_insert_with(Default::default);
                write_concern.journal = Some(get_bool!(value, k));
            }
            k @ "localthresholdms" => {
                self.local_threshold = Some(Duration::from_millis(get_duration!(value, k)))
            }
            k @ "maxidletimems" => {
                self.max_idle_time = Some(Duration::from_millis(get_duration!(value, k)));
            }
            k @ "maxstalenessseconds" => {
                // -1 means no maximum.
                if value == "-1" {
                    return Ok(());
                }
                let max_staleness = Duration::from_secs(get_duration!(value, k));

                if max_staleness > Duration::from_secs(0) && max_staleness < Duration::from_secs(90)
                {
                    return Err(Error::invalid_argument(
                        "'maxStalenessSeconds' cannot be both positive and below 90",
                    ));
                }

                self.max_staleness = Some(max_staleness);
            }
            k @ "maxconnecting" => {
                self.max_connecting = Some(get_u32!(value, k));
            }
            k @ "maxpoolsize" => {
                self.max_pool_size = Some(get_u32!(value, k));
            }
            k @ "minpoolsize" => {
                self.min_pool_size = Some(get_u32!(value, k));
            }
            "readpreference" => {
                self.read_preference = Some(match &value.to_lowercase()[..] {
                    "primary" => ReadPreference::Primary,
                    "secondary" => ReadPreference::Secondary {
                        options: Default::default(),
                    },
                    "primarypreferred" => ReadPreference::PrimaryPreferred {
                        options: Default::default(),
                    },
                    "secondarypreferred" => ReadPreference::SecondaryPreferred {
                        options: Default::default(),
                    },
                    "nearest" => ReadPreference::Nearest {
                        options: Default::default(),
                    },
                    other => {
                        return Err(Error::invalid_argument(format!(
                            "'{}' is not a valid read preference",
                            other
                        )))
                    }
                });
            }
            "readpreferencetags" => {
                let tags: Result<TagSet> = if value.is_empty() {
                    Ok(TagSet::new())
                } else {
                    value
                        .split(',')
                        .map(|tag| match tag.split_once(':') {
                            Some((key, value)) => Ok((key.to_string(), value.to_string())),
                            None => Err(Error::invalid_argument(format!(
                                "'{}' is not a valid read preference tag (which must be of the \
                                 form 'key:value')",
                                tag,
                            ))),
                        })
                        .collect()
                };

                self.read_preference_tags
                    .get_or_insert_with(Vec::new)
                    .push(tags?);
            }
            "replicaset" => {
                self.repl_set_name = Some(value.to_string());
            }
            k @ "retrywrites" => {
                self.retry_writes = Some(get_bool!(value, k));
            }
            k @ "retryreads" => {
                self.retry_reads = Some(get_bool!(value, k));
            }
            k @ "serverselectiontimeoutms" => {
                self.server_selection_timeout = Some(Duration::from_millis(get_duration!(value, k)))
            }
            k @ "sockettimeoutms" => {
                self.socket_timeout = Some(Duration::from_millis(get_duration!(value, k)));
            }
            k @ "tls" | k @ "ssl" => {
                let tls = get_bool!(value, k);

                match (self.tls.as_ref(), tls) {
                    (Some(Tls::Disabled), true) | (Some(Tls::Enabled(..)), false) => {
                        return Err(Error::invalid_argument(
                            "All instances of `tls` and `ssl` must have the same value",
                        ));
                    }
                    _ => {}
                };

                if self.tls.is_none() {
                    self.tls = Some(if tls {
                        Tls::Enabled(Default::default())
                    } else {
                        Tls::Disabled
                    });
                }
            }
            "tlscafile" => match self.tls {
                Some(Tls::Disabled) => {
                    return Err(Error::invalid_argument("'tlsCAFile' can't be set if tls=false"));
                }
                Some(Tls::Enabled(ref mut options)) => {
                    options.ca_file_path = Some(PathBuf::from(value));
                }
                None => {
                    self.tls = Some(Tls::Enabled(
                        TlsOptions::builder()
                            .ca_file_path(PathBuf::from(value))
                            .build(),
                    ))
                }
            },
            "w" => {
                let write_concern = self.write_concern.get_or_insert_with(Default::default);

                match value.parse::<i32>() {
                    Ok(w) => match u32::try_from(w) {
                        Ok(w) => write_concern.w = Some(Acknowledgment::from(w)),
                        Err(_) => {
                            return Err(Error::invalid_argument(
                                "connection string `w` option cannot be a negative integer",
                            ))
                        }
                    },
                    Err(_) => {
                        write_concern.w = Some(Acknowledgment::from(value.to_string()));
                    }
                };
            }
            k @ "waitqueuetimeoutms" => {
                self.wait_queue_timeout = Some(Duration::from_millis(get_duration!(value, k)));
            }
            k @ "wtimeoutms" => {
                let write_concern = self.write_concern.get_or_insert_with(Default::default);
                write_concern.w_timeout = Some(Duration::from_millis(get_duration!(value, k)));
            }

            other => {
                let (jaro_winkler, option) = URI_OPTIONS.iter().fold((0.0, ""), |acc, option| {
                    let jaro_winkler = jaro_winkler(option, other).abs();
                    if jaro_winkler > acc.0 {
                        return (jaro_winkler, option);
                    }
                    acc
                });
                let mut message = format!("{} is an invalid option", other);
                if jaro_winkler >= 0.84 {
                    message.push_str(&format!(
                        ". An option with a similar name exists: {}",
                        option
                    ));
                }
                return Err(ErrorKind::InvalidArgument { message }.into());
            }
        }

        Ok(())
    }
}
