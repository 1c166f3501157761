use percent_encoding::percent_decode_str;
use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use url::Url;

/// Login extracted from a mirror URL. FTP mirrors without userinfo log in
/// anonymously.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: Option<SecretString>,
}

impl PartialEq for Credentials {
    fn eq(&self, other: &Self) -> bool {
        self.username == other.username
            && self.password.as_ref().map(|x| x.expose_secret())
                == other.password.as_ref().map(|x| x.expose_secret())
    }
}

impl Eq for Credentials {}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl Credentials {
    pub fn new(username: &str, password: Option<&str>) -> Credentials {
        Credentials {
            username: username.to_string(),
            password: password.map(SecretString::from),
        }
    }

    pub fn anonymous() -> Credentials {
        Credentials::new("anonymous", Some("anonymous@"))
    }

    /// Reads percent-decoded userinfo from `url`. None when the URL carries
    /// no username.
    pub fn from_url(url: &Url) -> Option<Credentials> {
        if url.username().is_empty() {
            return None;
        }
        let username = percent_decode_str(url.username())
            .decode_utf8_lossy()
            .into_owned();
        let password = url
            .password()
            .map(|p| percent_decode_str(p).decode_utf8_lossy().into_owned());
        Some(Credentials::new(&username, password.as_deref()))
    }

    pub fn from_url_or_anonymous(url: &Url) -> Credentials {
        Self::from_url(url).unwrap_or_else(Self::anonymous)
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_ref().map(|p| p.expose_secret())
    }
}
