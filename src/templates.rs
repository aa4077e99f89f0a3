//! Email rendering
//!
//! Rendering is deterministic and side-effect free: typed inputs in, subject
//! and HTML out. The copy itself is owned by the product team; only the
//! structure matters here.

pub const VERIFICATION_SUBJECT: &str = "Verify your email address";
pub const PASSWORD_RESET_SUBJECT: &str = "Reset your password";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub subject: String,
    pub html: String,
}

pub fn verification(verification_url: &str) -> RenderedEmail {
    RenderedEmail {
        subject: VERIFICATION_SUBJECT.to_string(),
        html: format!(
            "<html><body>\
             <h2>Confirm your email address</h2>\
             <p>Thanks for signing up. Click the link below to verify your address:</p>\
             <p><a href=\"{verification_url}\">Verify email</a></p>\
             <p>Or paste this link into your browser: {verification_url}</p>\
             <p>If you did not create an account, you can ignore this message.</p>\
             </body></html>"
        ),
    }
}

pub fn password_reset(reset_url: &str) -> RenderedEmail {
    RenderedEmail {
        subject: PASSWORD_RESET_SUBJECT.to_string(),
        html: format!(
            "<html><body>\
             <h2>Reset your password</h2>\
             <p>We received a request to reset your password. The link below is valid for a limited time:</p>\
             <p><a href=\"{reset_url}\">Reset password</a></p>\
             <p>Or paste this link into your browser: {reset_url}</p>\
             <p>If you did not request a reset, you can ignore this message.</p>\
             </body></html>"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verification_embeds_url_and_subject() {
        let rendered = verification("https://app.test/v?t=abc");
        assert_eq!(rendered.subject, "Verify your email address");
        assert!(rendered.html.contains("https://app.test/v?t=abc"));
    }

    #[test]
    fn password_reset_embeds_url_and_subject() {
        let rendered = password_reset("https://app.test/r?t=xyz");
        assert_eq!(rendered.subject, "Reset your password");
        assert!(rendered.html.contains("https://app.test/r?t=xyz"));
    }

    #[test]
    fn rendering_is_deterministic() {
        assert_eq!(verification("https://a/v"), verification("https://a/v"));
        assert_eq!(password_reset("https://a/r"), password_reset("https://a/r"));
    }
}
