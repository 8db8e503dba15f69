use std::fmt::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

impl Order {
    fn as_str(&self) -> &'static str {
        match self {
            Order::Asc => "asc",
            Order::Desc => "desc",
        }
    }
}

/// PostgREST row query limited to equality/comparison filters, a single
/// ordering and a row limit.
#[derive(Debug, Clone)]
pub struct RowQuery {
    table: String,
    columns: Option<String>,
    filters: Vec<(String, String)>,
    order: Option<(String, Order)>,
    limit: Option<usize>,
}

impl RowQuery {
    pub fn table(name: &str) -> Self {
        Self {
            table: name.to_string(),
            columns: None,
            filters: Vec::new(),
            order: None,
            limit: None,
        }
    }

    pub fn select(mut self, columns: &str) -> Self {
        self.columns = Some(columns.to_string());
        self
    }

    pub fn eq(self, column: &str, value: impl Display) -> Self {
        self.filter(column, "eq", value)
    }

    pub fn lt(self, column: &str, value: impl Display) -> Self {
        self.filter(column, "lt", value)
    }

    pub fn order(mut self, column: &str, order: Order) -> Self {
        self.order = Some((column.to_string(), order));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn filter(mut self, column: &str, operator: &str, value: impl Display) -> Self {
        self.filters.push((column.to_string(), format!("{}.{}", operator, value)));
        self
    }

    /// Render as a `/rest/v1/<table>?...` path with encoded filter values.
    pub fn to_path(&self) -> String {
        let mut params = Vec::new();

        if let Some(columns) = &self.columns {
            params.push(format!("select={}", urlencoding::encode(columns)));
        }
        for (column, expression) in &self.filters {
            params.push(format!("{}={}", column, urlencoding::encode(expression)));
        }
        if let Some((column, order)) = &self.order {
            params.push(format!("order={}.{}", column, order.as_str()));
        }
        if let Some(limit) = self.limit {
            params.push(format!("limit={}", limit));
        }

        if params.is_empty() {
            format!("/rest/v1/{}", self.table)
        } else {
            format!("/rest/v1/{}?{}", self.table, params.join("&"))
        }
    }
}
