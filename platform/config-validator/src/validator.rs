use std::fmt::Display;
use std::str::FromStr;

use crate::ConfigError;

type Lookup<'a> = Box<dyn Fn(&str) -> Option<String> + 'a>;

/// Reads variables and collects every problem instead of stopping at the
/// first one; [`finish`](Self::finish) reports them together.
pub struct ConfigValidator<'a> {
    lookup: Lookup<'a>,
    errors: Vec<String>,
}

impl ConfigValidator<'static> {
    pub fn from_env() -> Self {
        Self::with_lookup(|name| std::env::var(name).ok())
    }
}

impl<'a> ConfigValidator<'a> {
    pub fn with_lookup(lookup: impl Fn(&str) -> Option<String> + 'a) -> Self {
        Self {
            lookup: Box::new(lookup),
            errors: Vec::new(),
        }
    }

    /// Trimmed value; blank counts as unset.
    pub fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    pub fn require(&mut self, name: &str) -> Option<String> {
        let value = self.raw(name);
        if value.is_none() {
            self.errors.push(format!("{name} must be set"));
        }
        value
    }

    pub fn optional_or(&self, name: &str, default: &str) -> String {
        self.raw(name).unwrap_or_else(|| default.to_string())
    }

    /// Parsed value, `default` when unset.
    pub fn parse_or<T>(&mut self, name: &str, default: T) -> T
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.raw(name) {
            None => default,
            Some(raw) => match raw.parse::<T>() {
                Ok(v) => v,
                Err(e) => {
                    self.errors.push(format!("{name}={raw:?} is invalid: {e}"));
                    default
                }
            },
        }
    }

    /// Like [`parse_or`](Self::parse_or) but the result must be > 0.
    pub fn positive_or<T>(&mut self, name: &str, default: T) -> T
    where
        T: FromStr + PartialOrd + Default + Copy + Display,
        T::Err: Display,
    {
        let value = self.parse_or(name, default);
        if value <= T::default() {
            self.errors.push(format!("{name} must be greater than zero, got {value}"));
            return default;
        }
        value
    }

    /// Like [`positive_or`](Self::positive_or) with an upper bound.
    pub fn bounded_or<T>(&mut self, name: &str, default: T, max: T) -> T
    where
        T: FromStr + PartialOrd + Default + Copy + Display,
        T::Err: Display,
    {
        let value = self.positive_or(name, default);
        if value > max {
            self.errors.push(format!("{name} must be at most {max}, got {value}"));
            return max;
        }
        value
    }

    /// Lowercased value restricted to `allowed`.
    pub fn one_of(&mut self, name: &str, allowed: &[&str], default: &str) -> String {
        let value = self.optional_or(name, default).to_lowercase();
        if !allowed.contains(&value.as_str()) {
            self.errors.push(format!(
                "{name}={value:?} is invalid: expected one of {}",
                allowed.join(", ")
            ));
            return default.to_string();
        }
        value
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn finish(self) -> Result<(), ConfigError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(self.errors))
        }
    }
}
