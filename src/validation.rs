//! Input validation and normalisation.
//!
//! Every check returns `Err(message)` with a user-facing message; callers
//! wrap it in the error type of their layer (`CircleError::Validation`,
//! `AuthError::Validation`).

/// Maximum display name length (characters, after trimming).
pub const MAX_NAME_LENGTH: usize = 50;

/// Maximum e-mail length.
pub const MAX_EMAIL_LENGTH: usize = 254;

/// Maximum city/location length.
pub const MAX_CITY_LENGTH: usize = 80;

/// Maximum address length.
pub const MAX_ADDRESS_LENGTH: usize = 150;

/// Maximum length kept by [`sanitize_text`].
pub const MAX_SANITIZED_LENGTH: usize = 200;

/// Invite codes are exactly this long.
pub const INVITE_CODE_LENGTH: usize = 6;

/// Result of a validation check.
pub type Validation = std::result::Result<(), String>;

/// Strips angle brackets, trims, and caps the text at 200 characters.
#[must_use]
pub fn sanitize_text(input: &str) -> String {
    input
        .chars()
        .filter(|c| *c != '<' && *c != '>')
        .collect::<String>()
        .trim()
        .chars()
        .take(MAX_SANITIZED_LENGTH)
        .collect()
}

/// Returns only the ASCII digits of a phone number.
///
/// Two phone numbers identify the same person when their normalised forms
/// are equal, so `"050-123-4567"` and `"0501234567"` collide.
#[must_use]
pub fn normalize_phone(phone: &str) -> String {
    phone.chars().filter(char::is_ascii_digit).collect()
}

/// Formats a 9 or 10 digit local number as `0XX-XXXXXXX`.
///
/// Anything else is returned unchanged.
#[must_use]
pub fn format_phone(phone: &str) -> String {
    let digits = normalize_phone(phone);
    match digits.len() {
        9 => format!("0{}-{}", &digits[..3], &digits[3..]),
        10 if digits.starts_with('0') => format!("{}-{}", &digits[..4], &digits[4..]),
        _ => phone.to_string(),
    }
}

/// Validates an e-mail address.
///
/// # Errors
///
/// Returns a message when the address is empty, too long, or not of the
/// form `local@domain.tld` with a top-level domain of at least two characters.
pub fn validate_email(email: &str) -> Validation {
    let trimmed = email.trim();
    if trimmed.is_empty() {
        return Err("Please enter an e-mail address".to_string());
    }
    if trimmed.len() > MAX_EMAIL_LENGTH {
        return Err("E-mail address is too long".to_string());
    }

    let invalid = || Err("Invalid e-mail address".to_string());
    if trimmed.chars().any(char::is_whitespace) {
        return invalid();
    }
    let Some((local, domain)) = trimmed.split_once('@') else {
        return invalid();
    };
    if local.is_empty() || domain.contains('@') {
        return invalid();
    }
    let Some((host, tld)) = domain.rsplit_once('.') else {
        return invalid();
    };
    if host.is_empty() || tld.chars().count() < 2 {
        return invalid();
    }
    Ok(())
}

/// Validates a password.
///
/// # Errors
///
/// Returns a message when the password is empty, shorter than 6 or longer
/// than 128 characters.
pub fn validate_password(password: &str) -> Validation {
    let len = password.chars().count();
    if len == 0 {
        return Err("Please enter a password".to_string());
    }
    if len < 6 {
        return Err("Password must be at least 6 characters".to_string());
    }
    if len > 128 {
        return Err("Password is too long".to_string());
    }
    Ok(())
}

/// Validates a display name length.
///
/// # Errors
///
/// Returns a message when the trimmed name exceeds 50 characters.
pub fn validate_display_name(name: &str) -> Validation {
    if name.trim().chars().count() > MAX_NAME_LENGTH {
        return Err(format!("Name is too long (max {MAX_NAME_LENGTH} characters)"));
    }
    Ok(())
}

/// Validates a phone number.
///
/// Accepts 7-20 characters of digits, `-`, `+`, `(`, `)` and spaces, which
/// must reduce to either 9 digits starting with 2-9 or 10 digits starting
/// with 0.
///
/// # Errors
///
/// Returns a message describing the first failed rule.
pub fn validate_phone(phone: &str) -> Validation {
    let trimmed = phone.trim();
    if trimmed.is_empty() {
        return Err("Please enter a phone number".to_string());
    }
    let len = trimmed.chars().count();
    let allowed = |c: char| c.is_ascii_digit() || matches!(c, '-' | '+' | '(' | ')' | ' ');
    if !(7..=20).contains(&len) || !trimmed.chars().all(allowed) {
        return Err("Phone number contains invalid characters".to_string());
    }

    let digits = normalize_phone(trimmed);
    let valid = match digits.len() {
        9 => matches!(digits.as_bytes()[0], b'2'..=b'9'),
        10 => digits.starts_with('0'),
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err("Invalid phone number".to_string())
    }
}

/// Validates an invite code after trimming and upper-casing.
///
/// # Errors
///
/// Returns a message when the code is empty, not 6 characters long, or
/// contains anything other than `A-Z` and `0-9`.
pub fn validate_invite_code(code: &str) -> Validation {
    let normalized = code.trim().to_uppercase();
    if normalized.is_empty() {
        return Err("Please enter a code".to_string());
    }
    if normalized.chars().count() != INVITE_CODE_LENGTH {
        return Err(format!("Code must be {INVITE_CODE_LENGTH} characters"));
    }
    if !normalized
        .chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
    {
        return Err("Code contains invalid characters".to_string());
    }
    Ok(())
}

/// Validates a city name length.
///
/// # Errors
///
/// Returns a message when the trimmed city exceeds 80 characters.
pub fn validate_city(city: &str) -> Validation {
    if city.trim().chars().count() > MAX_CITY_LENGTH {
        return Err(format!("City is too long (max {MAX_CITY_LENGTH} characters)"));
    }
    Ok(())
}

/// Validates a free-text location length.
///
/// # Errors
///
/// Returns a message when the trimmed location exceeds 80 characters.
pub fn validate_location(location: &str) -> Validation {
    if location.trim().chars().count() > MAX_CITY_LENGTH {
        return Err(format!(
            "Location is too long (max {MAX_CITY_LENGTH} characters)"
        ));
    }
    Ok(())
}

/// Validates an address length.
///
/// # Errors
///
/// Returns a message when the trimmed address exceeds 150 characters.
pub fn validate_address(address: &str) -> Validation {
    if address.trim().chars().count() > MAX_ADDRESS_LENGTH {
        return Err(format!(
            "Address is too long (max {MAX_ADDRESS_LENGTH} characters)"
        ));
    }
    Ok(())
}
