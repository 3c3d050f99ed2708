use actix_web::cookie::time::Duration;
use actix_web::cookie::{Cookie, SameSite};

/// Attributes of the session cookie. Every cookie written, including the
/// clearing one, carries the same attributes so browsers treat them as the
/// same cookie.
#[derive(Debug, Clone, PartialEq)]
pub struct CookiePolicy {
    pub name: String,
    /// Max-Age in seconds, equal to the credential's policy window
    pub max_age: u64,
    pub secure: bool,
}

impl CookiePolicy {
    pub fn issue(&self, value: String) -> Cookie<'static> {
        self.build(value, self.max_age as i64)
    }

    /// Empty value with zero max-age: immediate client-side expiry.
    pub fn clear(&self) -> Cookie<'static> {
        self.build(String::new(), 0)
    }

    fn build(&self, value: String, max_age: i64) -> Cookie<'static> {
        Cookie::build(self.name.clone(), value)
            .path("/")
            .http_only(true)
            .secure(self.secure)
            .same_site(SameSite::Strict)
            .max_age(Duration::seconds(max_age))
            .finish()
    }
}
