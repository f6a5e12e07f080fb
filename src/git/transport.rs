use std::path::PathBuf;

use git2::{
    cert::Cert, AutotagOption, CertificateCheckStatus, Config, Cred, CredentialType, FetchOptions,
    RemoteCallbacks,
};
use log::{debug, trace, warn};
use ssh_key::known_hosts::{Entry, HostPatterns, Marker};
use ssh_key::KnownHosts;

const GLOBAL_KNOWN_HOSTS: &str = "/etc/ssh/ssh_known_hosts";

/// Optional HTTP credentials. When absent the git credential helper is asked instead.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct HttpCredentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl HttpCredentials {
    pub fn new(username: Option<String>, password: Option<String>) -> Self {
        HttpCredentials { username, password }
    }

    fn userpass(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some((username, password)),
            _ => None,
        }
    }
}

impl std::fmt::Debug for HttpCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpCredentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Builds the remote callbacks used by clone and fetch.
///
/// Holds no libgit2 handles so that a repository using it can move to the
/// blocking pool.
pub struct GitTransport {
    credentials: HttpCredentials,
    credential_helper: bool,
    known_hosts: Vec<PathBuf>,
}

impl GitTransport {
    pub fn new(credentials: HttpCredentials) -> Self {
        let mut known_hosts = Vec::new();
        if let Some(home) = home::home_dir() {
            known_hosts.push(home.join(".ssh").join("known_hosts"));
        }
        known_hosts.push(PathBuf::from(GLOBAL_KNOWN_HOSTS));
        GitTransport {
            credentials,
            credential_helper: true,
            known_hosts,
        }
    }

    /// Never consults the git configuration for credentials.
    pub fn without_credential_helper(mut self) -> Self {
        self.credential_helper = false;
        self
    }

    pub fn fetch_options(&self) -> FetchOptions<'_> {
        let mut callbacks = RemoteCallbacks::new();
        let mut attempts = 0;
        callbacks.credentials(move |url, username, allowed_types| {
            trace!(
                "Requested credentials for {}, username {:?}, allowed types {:?}",
                url,
                username,
                allowed_types
            );
            // libgit2 keeps asking as long as the callback succeeds, stop after a few rounds
            attempts += 1;
            if attempts > 3 {
                return Err(auth_error("credentials were rejected by the remote"));
            }
            if allowed_types.contains(CredentialType::USERNAME) {
                return Cred::username("git");
            }
            if allowed_types.contains(CredentialType::SSH_KEY) {
                return Cred::ssh_key_from_agent(username.unwrap_or("git"));
            }
            if allowed_types.contains(CredentialType::USER_PASS_PLAINTEXT) {
                if let Some((user, password)) = self.credentials.userpass() {
                    return Cred::userpass_plaintext(user, password);
                }
                if self.credential_helper {
                    let git_config = Config::open_default()?;
                    return Cred::credential_helper(&git_config, url, username);
                }
            }
            Err(auth_error("no valid authentication available"))
        });

        callbacks.certificate_check(|certificate, host| self.check_certificate(certificate, host));

        let mut fetch_options = FetchOptions::new();
        fetch_options
            .remote_callbacks(callbacks)
            .download_tags(AutotagOption::None);

        fetch_options
    }

    /// Accepts ssh host keys listed in the user or system known hosts files,
    /// refuses revoked ones and leaves everything else to libgit2.
    fn check_certificate(
        &self,
        certificate: &Cert<'_>,
        host: &str,
    ) -> Result<CertificateCheckStatus, git2::Error> {
        let Some(hostkey) = certificate.as_hostkey().and_then(|h| h.hostkey()) else {
            return Ok(CertificateCheckStatus::CertificatePassthrough);
        };

        for file in &self.known_hosts {
            let entries = match KnownHosts::read_file(file) {
                Ok(entries) => entries,
                Err(error) => {
                    trace!("Skipping {}: {}", file.display(), error);
                    continue;
                }
            };
            match host_key_status(&entries, host, hostkey) {
                HostKeyStatus::Trusted => {
                    debug!("Host key of {} is listed in {}", host, file.display());
                    return Ok(CertificateCheckStatus::CertificateOk);
                }
                HostKeyStatus::Revoked => {
                    warn!("Host key of {} is revoked in {}", host, file.display());
                    return Err(git2::Error::new(
                        git2::ErrorCode::Certificate,
                        git2::ErrorClass::Ssh,
                        format!("host key of {host} is revoked"),
                    ));
                }
                HostKeyStatus::Unknown => {}
            }
        }
        trace!("No known hosts entry for {}", host);
        Ok(CertificateCheckStatus::CertificatePassthrough)
    }
}

fn auth_error(message: &str) -> git2::Error {
    git2::Error::new(git2::ErrorCode::Auth, git2::ErrorClass::Callback, message)
}

#[derive(Debug, PartialEq, Eq)]
enum HostKeyStatus {
    Trusted,
    Revoked,
    Unknown,
}

/// A revoked entry wins over any number of plain ones. Certificate authority
/// entries are ignored since libgit2 hands over raw host keys only.
fn host_key_status(entries: &[Entry], host: &str, hostkey: &[u8]) -> HostKeyStatus {
    let mut status = HostKeyStatus::Unknown;
    for entry in entries {
        let same_key = entry
            .public_key()
            .to_bytes()
            .is_ok_and(|bytes| bytes == hostkey);
        if !same_key || !host_matches(host, entry.host_patterns()) {
            continue;
        }
        match entry.marker() {
            Some(Marker::Revoked) => return HostKeyStatus::Revoked,
            Some(Marker::CertAuthority) => {}
            None => status = HostKeyStatus::Trusted,
        }
    }
    status
}

/// Matches `host` against a comma separated pattern list with `*` and `?`
/// wildcards. A matching negated pattern rejects the host outright.
fn host_matches(host: &str, patterns: &HostPatterns) -> bool {
    let HostPatterns::Patterns(patterns) = patterns else {
        // hashed names
        return false;
    };
    let host = host.to_ascii_lowercase();
    let mut matched = false;
    for pattern in patterns {
        let pattern = pattern.to_ascii_lowercase();
        match pattern.strip_prefix('!') {
            Some(negated) => {
                if wildcard_match(negated.as_bytes(), host.as_bytes()) {
                    return false;
                }
            }
            None => matched |= wildcard_match(pattern.as_bytes(), host.as_bytes()),
        }
    }
    matched
}

fn wildcard_match(pattern: &[u8], text: &[u8]) -> bool {
    match (pattern.split_first(), text.split_first()) {
        (None, _) => text.is_empty(),
        (Some((&b'*', rest)), _) => {
            wildcard_match(rest, text) || (!text.is_empty() && wildcard_match(pattern, &text[1..]))
        }
        (Some((&b'?', rest)), Some((_, text_rest))) => wildcard_match(rest, text_rest),
        (Some((expected, rest)), Some((actual, text_rest))) => {
            expected == actual && wildcard_match(rest, text_rest)
        }
        (Some(_), None) => false,
    }
}
