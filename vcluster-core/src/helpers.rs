use std::{
    collections::HashMap,
    time::{Duration, SystemTime},
};

pub fn get_secs_since_unix_epoch() -> f64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs_f64()
}

pub trait With<F> {
    fn with(self, op: F) -> Self;
}

impl<T, F> With<F> for T
where
    F: FnOnce(&mut Self),
{
    fn with(mut self, op: F) -> Self {
        op(&mut self);

        self
    }
}

pub trait AndIf<F> {
    fn and_if(self, condition: bool, then: F) -> Self;
}

pub trait AndIfSome<F, FC> {
    fn and_if_some(self, closure: FC, then: F) -> Self;
}

impl<T, F> AndIf<F> for T
where
    F: FnOnce(Self) -> Self,
{
    fn and_if(self, condition: bool, then: F) -> Self {
        let mut obj = self;
        if condition {
            obj = then(obj);
        }

        obj
    }
}

impl<T, TC, F, FC> AndIfSome<F, FC> for T
where
    F: FnOnce(Self, TC) -> Self,
    FC: FnOnce() -> Option<TC>,
{
    fn and_if_some(self, closure: FC, then: F) -> Self {
        let mut obj = self;
        if let Some(result) = closure() {
            obj = then(obj, result);
        }

        obj
    }
}

/// Label lookups on backend objects that must carry them.
pub trait RequireLabels<E> {
    fn require_label_or(&self, key: &str, error: E) -> Result<&str, E>;
    fn require_label_or_else(&self, key: &str, error: impl FnOnce() -> E) -> Result<&str, E>;
}

impl<E> RequireLabels<E> for HashMap<String, String> {
    fn require_label_or(&self, key: &str, error: E) -> Result<&str, E> {
        Ok(self.get(key).ok_or(error)?.as_str())
    }

    fn require_label_or_else(&self, key: &str, error: impl FnOnce() -> E) -> Result<&str, E> {
        Ok(self.get(key).ok_or_else(error)?.as_str())
    }
}
