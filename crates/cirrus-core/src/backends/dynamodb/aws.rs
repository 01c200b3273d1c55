use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::error::DisplayErrorContext;
use aws_sdk_dynamodb::types::AttributeValue as SdkValue;

use super::client::{
    AttributeValue, DeleteItemInput, DynamoApi, GetItemInput, Item, Page, PutItemInput,
    QueryInput, ScanInput,
};
use crate::config::DynamoConfig;
use crate::error::{Error, Result};

/// [`DynamoApi`] over the AWS SDK client.
#[derive(Clone)]
pub struct AwsDynamo {
    client: Client,
}

impl AwsDynamo {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from ambient AWS credentials, honoring the configured
    /// region and endpoint override.
    pub async fn from_config(config: &DynamoConfig) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint.clone());
        }
        let sdk_config = loader.load().await;
        Self::new(Client::new(&sdk_config))
    }
}

#[async_trait]
impl DynamoApi for AwsDynamo {
    async fn get_item(&self, input: GetItemInput) -> Result<Option<Item>> {
        let out = self
            .client
            .get_item()
            .table_name(&input.table)
            .set_key(Some(to_sdk_item(&input.key)))
            .send()
            .await
            .map_err(|e| sdk_error("GetItem", &input.table, e))?;
        Ok(out.item().map(from_sdk_item))
    }

    async fn put_item(&self, input: PutItemInput) -> Result<()> {
        self.client
            .put_item()
            .table_name(&input.table)
            .set_item(Some(to_sdk_item(&input.item)))
            .send()
            .await
            .map_err(|e| sdk_error("PutItem", &input.table, e))?;
        Ok(())
    }

    async fn delete_item(&self, input: DeleteItemInput) -> Result<()> {
        self.client
            .delete_item()
            .table_name(&input.table)
            .set_key(Some(to_sdk_item(&input.key)))
            .send()
            .await
            .map_err(|e| sdk_error("DeleteItem", &input.table, e))?;
        Ok(())
    }

    async fn query(&self, input: QueryInput) -> Result<Page> {
        let out = self
            .client
            .query()
            .table_name(&input.table)
            .key_condition_expression(&input.key_condition_expression)
            .set_filter_expression(input.filter_expression.clone())
            .set_expression_attribute_names(Some(input.attributes.names.clone()))
            .set_expression_attribute_values(Some(to_sdk_item(&input.attributes.values)))
            .set_limit(input.limit)
            .set_exclusive_start_key(input.exclusive_start_key.as_ref().map(to_sdk_item))
            .send()
            .await
            .map_err(|e| sdk_error("Query", &input.table, e))?;
        Ok(Page {
            items: out.items().iter().map(from_sdk_item).collect(),
            last_evaluated_key: out.last_evaluated_key().map(from_sdk_item),
        })
    }

    async fn scan(&self, input: ScanInput) -> Result<Page> {
        let out = self
            .client
            .scan()
            .table_name(&input.table)
            .set_filter_expression(input.filter_expression.clone())
            .set_expression_attribute_names(Some(input.attributes.names.clone()))
            .set_expression_attribute_values(Some(to_sdk_item(&input.attributes.values)))
            .set_limit(input.limit)
            .set_exclusive_start_key(input.exclusive_start_key.as_ref().map(to_sdk_item))
            .send()
            .await
            .map_err(|e| sdk_error("Scan", &input.table, e))?;
        Ok(Page {
            items: out.items().iter().map(from_sdk_item).collect(),
            last_evaluated_key: out.last_evaluated_key().map(from_sdk_item),
        })
    }
}

fn sdk_error<E>(operation: &str, table: &str, err: E) -> Error
where
    E: std::error::Error + 'static,
{
    Error::request(format!("{operation} {table}"), DisplayErrorContext(&err))
}

fn to_sdk(value: &AttributeValue) -> SdkValue {
    match value {
        AttributeValue::S(s) => SdkValue::S(s.clone()),
        AttributeValue::N(n) => SdkValue::N(n.clone()),
        AttributeValue::Bool(b) => SdkValue::Bool(*b),
        AttributeValue::Null => SdkValue::Null(true),
        AttributeValue::L(items) => SdkValue::L(items.iter().map(to_sdk).collect()),
        AttributeValue::M(map) => SdkValue::M(to_sdk_item(map)),
    }
}

fn from_sdk(value: &SdkValue) -> AttributeValue {
    match value {
        SdkValue::S(s) => AttributeValue::S(s.clone()),
        SdkValue::N(n) => AttributeValue::N(n.clone()),
        SdkValue::Bool(b) => AttributeValue::Bool(*b),
        SdkValue::L(items) => AttributeValue::L(items.iter().map(from_sdk).collect()),
        SdkValue::M(map) => AttributeValue::M(from_sdk_item(map)),
        SdkValue::Ss(items) => {
            AttributeValue::L(items.iter().cloned().map(AttributeValue::S).collect())
        }
        SdkValue::Ns(items) => {
            AttributeValue::L(items.iter().cloned().map(AttributeValue::N).collect())
        }
        // Binary and unknown variants have no document representation.
        _ => AttributeValue::Null,
    }
}

fn to_sdk_item(item: &HashMap<String, AttributeValue>) -> HashMap<String, SdkValue> {
    item.iter().map(|(k, v)| (k.clone(), to_sdk(v))).collect()
}

fn from_sdk_item(item: &HashMap<String, SdkValue>) -> Item {
    item.iter().map(|(k, v)| (k.clone(), from_sdk(v))).collect()
}
