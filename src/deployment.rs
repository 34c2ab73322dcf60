use crate::chain::ChainReader;
use crate::error::IndexerError;
use alloy_primitives::Address;
use tracing::info;

/// Finds the first block at which `address` has code, by binary search up to
/// `latest_block`.
pub async fn find_deployment_block(
    reader: &dyn ChainReader,
    address: Address,
    latest_block: u64,
) -> Result<u64, IndexerError> {
    info!("Searching for deployment block of contract {:?}", address);

    let code = reader.code_at(address, latest_block).await?;
    if code.is_empty() {
        return Err(IndexerError::Configuration(format!(
            "Address {:?} is not a deployed contract at block {}",
            address, latest_block
        )));
    }

    let mut left = 0u64;
    let mut right = latest_block;

    while left < right {
        let mid = left + (right - left) / 2;

        let code = reader.code_at(address, mid).await?;

        if code.is_empty() {
            left = mid + 1;
        } else {
            right = mid;
        }
    }

    info!("Contract deployed at block {}", left);
    Ok(left)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockChainReader;

    #[tokio::test]
    async fn finds_first_block_with_code() {
        let reader = MockChainReader::new(1, 10_000);
        reader.set_deployment_block(4_321);
        let block = find_deployment_block(&reader, Address::repeat_byte(1), 10_000)
            .await
            .unwrap();
        assert_eq!(block, 4_321);
    }

    #[tokio::test]
    async fn undeployed_address_is_a_configuration_error() {
        let reader = MockChainReader::new(1, 100);
        reader.set_deployment_block(500);
        let err = find_deployment_block(&reader, Address::repeat_byte(1), 100)
            .await
            .unwrap_err();
        assert!(matches!(err, IndexerError::Configuration(_)));
    }
}
