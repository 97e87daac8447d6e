//! Two-factor provider policy.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::AuthError;
use crate::principal::UserAccount;

/// Channel used to deliver the second factor.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TwoFactorProvider {
    Email,
    Sms,
}

impl core::fmt::Display for TwoFactorProvider {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TwoFactorProvider::Email => f.write_str("email"),
            TwoFactorProvider::Sms => f.write_str("sms"),
        }
    }
}

/// Enable two-factor authentication for `user` via `provider`.
///
/// The provider needs a contact method to deliver codes to: SMS needs a phone
/// number on file, email needs a confirmed address.
pub fn enable_two_factor(
    user: &mut UserAccount,
    provider: TwoFactorProvider,
) -> Result<(), AuthError> {
    match provider {
        TwoFactorProvider::Sms => {
            let has_phone = user
                .phone_number
                .as_deref()
                .is_some_and(|p| !p.trim().is_empty());
            if !has_phone {
                return Err(AuthError::validation(
                    "phone_number",
                    "a phone number is required to enable SMS two-factor authentication",
                ));
            }
        }
        TwoFactorProvider::Email => {
            if !user.email_confirmed {
                return Err(AuthError::validation(
                    "email_confirmed",
                    "a confirmed email address is required to enable email two-factor authentication",
                ));
            }
        }
    }

    user.two_factor = Some(provider);
    info!(user_id = %user.id, %provider, "two-factor authentication enabled");
    Ok(())
}

pub fn disable_two_factor(user: &mut UserAccount) {
    if let Some(provider) = user.two_factor.take() {
        info!(user_id = %user.id, %provider, "two-factor authentication disabled");
    }
}
