use std::fmt::Display;

use serde::Serialize;

use crate::cli::{OutputFormat, SpecFormat};

/// Cell printed as `-` when empty.
#[derive(Serialize)]
#[serde(transparent)]
pub struct TableCellOption<T>(Option<T>);

impl<T> From<Option<T>> for TableCellOption<T> {
    fn from(value: Option<T>) -> Self {
        TableCellOption(value)
    }
}

impl<T: Display> Display for TableCellOption<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            Some(value) => value.fmt(f),
            None => f.write_str("-"),
        }
    }
}

/// Comma separated cell, `-` when empty.
#[derive(Serialize)]
#[serde(transparent)]
pub struct TableCellSlice<'a, T>(&'a [T]);

impl<'a, T> From<&'a [T]> for TableCellSlice<'a, T> {
    fn from(value: &'a [T]) -> Self {
        TableCellSlice(value)
    }
}

impl<'a, T: Display> Display for TableCellSlice<'a, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Some((first, rest)) = self.0.split_first() else {
            return f.write_str("-");
        };

        first.fmt(f)?;
        for item in rest {
            f.write_str(",")?;
            item.fmt(f)?;
        }

        Ok(())
    }
}

pub trait TableOutputRow {
    fn print_name(&self);
    fn print_header();
    fn print_row(&self);
}

pub trait TableOutputDisplay {
    fn print_names(self);
    fn print_table(self);
    fn print_table_with_headers(self);
}

impl<I: IntoIterator<Item = T>, T: TableOutputRow> TableOutputDisplay for I {
    fn print_names(self) {
        for row in self {
            row.print_name();
        }
    }

    fn print_table(self) {
        for row in self {
            row.print_row();
        }
    }

    fn print_table_with_headers(self) {
        T::print_header();
        self.print_table();
    }
}

pub trait SerializableOutputDisplay {
    fn print_json(&self) -> Result<(), serde_json::Error>;
    fn print_json_pretty(&self) -> Result<(), serde_json::Error>;
    fn print_yaml(&self) -> Result<(), serde_yaml::Error>;
}

impl<T: ?Sized + Serialize> SerializableOutputDisplay for T {
    fn print_json(&self) -> Result<(), serde_json::Error> {
        println!("{}", serde_json::to_string(self)?);

        Ok(())
    }

    fn print_json_pretty(&self) -> Result<(), serde_json::Error> {
        println!("{}", serde_json::to_string_pretty(self)?);

        Ok(())
    }

    fn print_yaml(&self) -> Result<(), serde_yaml::Error> {
        print!("{}", serde_yaml::to_string(self)?);

        Ok(())
    }
}

pub trait CliPrint {
    fn print(self, format: OutputFormat) -> anyhow::Result<()>;
}

impl<T: Serialize + TableOutputDisplay> CliPrint for T {
    fn print(self, format: OutputFormat) -> anyhow::Result<()> {
        match format {
            OutputFormat::Names => self.print_names(),
            OutputFormat::Table => self.print_table(),
            OutputFormat::TableWithHeaders => self.print_table_with_headers(),
            OutputFormat::Json => self.print_json()?,
            OutputFormat::JsonPretty => self.print_json_pretty()?,
            OutputFormat::Yaml => self.print_yaml()?,
        }

        Ok(())
    }
}

/// Prints a document that has no table form.
pub trait DocumentPrint {
    fn print_document(&self, format: SpecFormat) -> anyhow::Result<()>;
}

impl<T: ?Sized + Serialize> DocumentPrint for T {
    fn print_document(&self, format: SpecFormat) -> anyhow::Result<()> {
        match format {
            SpecFormat::Json => self.print_json()?,
            SpecFormat::JsonPretty => self.print_json_pretty()?,
            SpecFormat::Yaml => self.print_yaml()?,
        }

        Ok(())
    }
}
