//! Connection string parsing.
//!
//! ```text
//! /local/path
//! nfs://[user@]server[:port]/export[/subpath][?key=val[&key=val]*]
//! smb://[domain;][user@]server[:port]/share[/subpath][?key=val[&key=val]*]
//! ```

use super::credentials::{mask_credentials, Secret};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Which backend a connection string selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// A local directory re-exported below the mount point
    Local,
    /// An NFS export
    Nfs,
    /// An SMB share
    Smb,
}

impl BackendKind {
    /// Short tag used in log lines.
    pub fn tag(&self) -> &'static str {
        match self {
            BackendKind::Local => "bind",
            BackendKind::Nfs => "nfs",
            BackendKind::Smb => "smb",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Errors raised while parsing a connection string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DescriptorError {
    /// The string names neither a local path nor a known scheme.
    #[error("unrecognized connection scheme in {0}")]
    UnrecognizedScheme(String),
    /// The string has a known scheme but is malformed.
    #[error("cannot parse connection string {conn}: {reason}")]
    Parse {
        /// Masked connection string
        conn: String,
        /// What was wrong with it
        reason: &'static str,
    },
}

/// A parsed connection string.
#[derive(Clone)]
pub struct ConnectionDescriptor {
    raw: String,
    /// Selected backend
    pub kind: BackendKind,
    /// SMB authentication domain
    pub domain: Option<String>,
    /// User name
    pub user: Option<String>,
    /// Server host name or address
    pub server: String,
    /// Explicit server port
    pub port: Option<u16>,
    /// SMB share name; empty for NFS and Local
    pub share: String,
    /// Export path for NFS, path below the share for SMB, the directory for Local
    pub path: String,
    /// Query parameters passed through to the client library, in order
    pub params: Vec<(String, String)>,
    /// Substitute uid from `uid=`
    pub uid: Option<u32>,
    /// Substitute gid from `gid=`
    pub gid: Option<u32>,
    /// Inline password from `password=`
    pub password: Option<Secret>,
    /// Credentials file from `credentials=`
    pub credentials: Option<PathBuf>,
}

/// Leading decimal digits of `value`, the way `%u` reads them.
fn leading_u32(value: &str) -> Option<u32> {
    let end = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    value[..end].parse().ok()
}

impl ConnectionDescriptor {
    /// Parses a connection string.
    pub fn parse(conn: &str) -> Result<Self, DescriptorError> {
        if conn.is_empty() {
            return Err(DescriptorError::Parse {
                conn: String::new(),
                reason: "empty connection string",
            });
        }
        if conn.starts_with('/') {
            return Ok(Self::local(conn));
        }

        let (scheme, rest) = conn
            .split_once("://")
            .ok_or_else(|| DescriptorError::UnrecognizedScheme(mask_credentials(conn)))?;
        let kind = match scheme {
            "nfs" => BackendKind::Nfs,
            "smb" => BackendKind::Smb,
            _ => return Err(DescriptorError::UnrecognizedScheme(mask_credentials(conn))),
        };

        let fail = |reason| DescriptorError::Parse {
            conn: mask_credentials(conn),
            reason,
        };

        let (location, query) = match rest.split_once('?') {
            Some((location, query)) => (location, Some(query)),
            None => (rest, None),
        };

        let (authority, path) = match location.find('/') {
            Some(idx) => (&location[..idx], &location[idx..]),
            None => (location, ""),
        };

        let (domain, authority) = match authority.split_once(';') {
            Some((domain, rest)) if kind == BackendKind::Smb => (Some(domain.to_string()), rest),
            Some(_) => return Err(fail("domain is only valid for smb")),
            None => (None, authority),
        };
        let (user, host) = match authority.rsplit_once('@') {
            Some((user, host)) => (Some(user.to_string()), host),
            None => (None, authority),
        };
        let (server, port) = match host.rsplit_once(':') {
            // Bracketed IPv6 literals keep their colons
            Some((server, port)) if !port.contains(']') => {
                let port = port.parse::<u16>().map_err(|_| fail("invalid port"))?;
                (server, Some(port))
            }
            _ => (host, None),
        };
        if server.is_empty() {
            return Err(fail("missing server"));
        }

        let (share, path) = match kind {
            BackendKind::Smb => {
                let trimmed = path.trim_start_matches('/');
                let (share, sub) = match trimmed.split_once('/') {
                    Some((share, sub)) => (share, sub),
                    None => (trimmed, ""),
                };
                if share.is_empty() {
                    return Err(fail("missing share"));
                }
                (share.to_string(), sub.to_string())
            }
            _ => {
                if path.is_empty() {
                    return Err(fail("missing export path"));
                }
                (String::new(), path.to_string())
            }
        };

        let mut descriptor = Self {
            raw: conn.to_string(),
            kind,
            domain,
            user,
            server: server.to_string(),
            port,
            share,
            path,
            params: Vec::new(),
            uid: None,
            gid: None,
            password: None,
            credentials: None,
        };

        for param in query.into_iter().flat_map(|q| q.split('&')) {
            if param.is_empty() {
                continue;
            }
            let (key, value) = param.split_once('=').unwrap_or((param, ""));
            match key {
                "uid" => descriptor.uid = leading_u32(value),
                "gid" => descriptor.gid = leading_u32(value),
                "password" => descriptor.password = Some(Secret::new(value)),
                "credentials" => descriptor.credentials = Some(PathBuf::from(value)),
                _ => descriptor
                    .params
                    .push((key.to_string(), value.to_string())),
            }
        }

        Ok(descriptor)
    }

    fn local(path: &str) -> Self {
        Self {
            raw: path.to_string(),
            kind: BackendKind::Local,
            domain: None,
            user: None,
            server: String::new(),
            port: None,
            share: String::new(),
            path: path.to_string(),
            params: Vec::new(),
            uid: None,
            gid: None,
            password: None,
            credentials: None,
        }
    }

    /// Display-safe form of the connection string.
    pub fn display(&self) -> String {
        mask_credentials(&self.raw)
    }

    /// The string handed to the client library's own URL parser.
    ///
    /// Contains the unmasked secret; must not be logged.
    pub fn client_url(&self) -> &str {
        &self.raw
    }
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("conn", &self.display())
            .field("kind", &self.kind)
            .field("server", &self.server)
            .field("share", &self.share)
            .field("path", &self.path)
            .field("uid", &self.uid)
            .field("gid", &self.gid)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_path() -> Result<(), DescriptorError> {
        let d = ConnectionDescriptor::parse("/srv/data")?;
        assert_eq!(d.kind, BackendKind::Local);
        assert_eq!(d.path, "/srv/data");
        assert!(d.server.is_empty());
        Ok(())
    }

    #[test]
    fn test_nfs_with_identity() -> Result<(), DescriptorError> {
        let d = ConnectionDescriptor::parse("nfs://host/export?uid=1000&gid=1000")?;
        assert_eq!(d.kind, BackendKind::Nfs);
        assert_eq!(d.server, "host");
        assert_eq!(d.path, "/export");
        assert_eq!(d.uid, Some(1000));
        assert_eq!(d.gid, Some(1000));
        assert!(d.params.is_empty());
        Ok(())
    }

    #[test]
    fn test_identity_takes_leading_digits() -> Result<(), DescriptorError> {
        let d = ConnectionDescriptor::parse("nfs://host/export?uid=12ab&gid=x5")?;
        assert_eq!(d.uid, Some(12));
        assert_eq!(d.gid, None);
        Ok(())
    }

    #[test]
    fn test_smb_full_form() -> Result<(), DescriptorError> {
        let d = ConnectionDescriptor::parse(
            "smb://WORK;alice@files.example:4445/public/docs/2024?vers=3&password=secret123&seal",
        )?;
        assert_eq!(d.kind, BackendKind::Smb);
        assert_eq!(d.domain.as_deref(), Some("WORK"));
        assert_eq!(d.user.as_deref(), Some("alice"));
        assert_eq!(d.server, "files.example");
        assert_eq!(d.port, Some(4445));
        assert_eq!(d.share, "public");
        assert_eq!(d.path, "docs/2024");
        let params: Vec<(&str, &str)> = d
            .params
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        assert!(params.contains(&("vers", "3")));
        assert!(params.contains(&("seal", "")));
        assert_eq!(d.password.as_ref().map(Secret::expose), Some("secret123"));
        Ok(())
    }

    #[test]
    fn test_display_and_debug_hide_password() -> Result<(), DescriptorError> {
        let d = ConnectionDescriptor::parse("smb://host/share?password=secret123")?;
        let shown = d.display();
        assert!(shown.contains("password=***"));
        assert!(!shown.contains("secret123"));
        assert!(!format!("{:?}", d).contains("secret123"));
        assert!(!d.to_string().contains("secret123"));
        Ok(())
    }

    #[test]
    fn test_reparsed_mask_does_not_yield_secret() -> Result<(), DescriptorError> {
        let d = ConnectionDescriptor::parse("smb://host/share?credentials=/root/.creds&password=pw")?;
        let again = ConnectionDescriptor::parse(&d.display())?;
        assert_eq!(again.password.as_ref().map(Secret::expose), Some("***"));
        assert_eq!(again.credentials, Some(PathBuf::from("*filepath*")));
        Ok(())
    }

    #[test]
    fn test_ipv6_literal_keeps_colons() -> Result<(), DescriptorError> {
        let d = ConnectionDescriptor::parse("nfs://[fe80::1]/export")?;
        assert_eq!(d.server, "[fe80::1]");
        assert_eq!(d.port, None);
        Ok(())
    }

    #[test]
    fn test_unrecognized_scheme() {
        assert!(matches!(
            ConnectionDescriptor::parse("ftp://host/x"),
            Err(DescriptorError::UnrecognizedScheme(_))
        ));
        assert!(matches!(
            ConnectionDescriptor::parse("relative/path"),
            Err(DescriptorError::UnrecognizedScheme(_))
        ));
    }

    #[test]
    fn test_empty_string_is_a_parse_error() {
        let err = ConnectionDescriptor::parse("").unwrap_err();
        assert!(matches!(err, DescriptorError::Parse { .. }));
        assert_eq!(
            crate::modules::mount::MountError::from(err).exit_code(),
            crate::modules::constants::EXIT_PARSE
        );
    }

    #[test]
    fn test_parse_failures() {
        for conn in [
            "nfs:///export",
            "nfs://host",
            "smb://host/",
            "smb://host:notaport/share",
            "nfs://dom;host/export",
        ] {
            assert!(
                matches!(
                    ConnectionDescriptor::parse(conn),
                    Err(DescriptorError::Parse { .. })
                ),
                "{} should fail to parse",
                conn
            );
        }
    }

    #[test]
    fn test_parse_error_is_masked() {
        let err = ConnectionDescriptor::parse("smb://host/?password=topsecret").unwrap_err();
        assert!(!err.to_string().contains("topsecret"));
    }
}
